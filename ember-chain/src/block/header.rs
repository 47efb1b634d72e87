//! Block headers.

use serde::{Deserialize, Serialize};

use super::{Hash, Height};

/// A block header.
///
/// The sync pipeline only relies on the parent link, the block number, and
/// the self-hash; the remaining fields are carried opaquely for the
/// importer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// The hash of the parent block's header.
    pub parent_hash: Hash,

    /// The number of this block: its height in the chain.
    pub number: Height,

    /// A commitment to the block body payload.
    pub payload_root: Hash,

    /// Arbitrary consensus data, opaque to the sync pipeline.
    pub nonce: u64,

    /// The block time, in seconds since the epoch.
    pub time: u32,
}

impl Header {
    /// Compute the hash of this header.
    pub fn hash(&self) -> Hash {
        self.into()
    }

    /// The canonical encoding of this header: the preimage of its hash.
    pub(super) fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + 8 + 32 + 8 + 4);
        bytes.extend_from_slice(&self.parent_hash.0);
        bytes.extend_from_slice(&self.number.0.to_le_bytes());
        bytes.extend_from_slice(&self.payload_root.0);
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes.extend_from_slice(&self.time.to_le_bytes());
        bytes
    }
}
