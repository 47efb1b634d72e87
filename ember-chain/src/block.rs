//! Blocks and block-related structures (heights, headers, hashes).

mod hash;
mod header;
mod height;

#[cfg(any(test, feature = "proptest-impl"))]
mod arbitrary;

#[cfg(test)]
mod tests;

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

pub use hash::{Hash, ParseHashError};
pub use header::Header;
pub use height::{Height, HeightDiff};

#[cfg(any(test, feature = "proptest-impl"))]
pub use arbitrary::{body_for, header_chain};

/// A block: a header plus its body payload.
///
/// The body is opaque to the sync pipeline; it is verified against the
/// header by the importer. Blocks are keyed by their header's hash.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// The block header, containing block metadata.
    pub header: Arc<Header>,
    /// The block body payload.
    pub body: Body,
}

impl Block {
    /// Compute the hash of this block, which is the hash of its header.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Return the height of this block.
    pub fn height(&self) -> Height {
        self.header.number
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.header.number.0, self.hash())
    }
}

/// An opaque block body payload.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Body(pub Vec<u8>);

impl Body {
    /// The serialized size of this body in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if this body carries no payload.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
