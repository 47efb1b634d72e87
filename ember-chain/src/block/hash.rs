//! Block hashes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[cfg(any(test, feature = "proptest-impl"))]
use proptest_derive::Arbitrary;

use super::Header;

/// A SHA-256d hash of a block [`Header`].
///
/// The hash of a header identifies the whole block, because the header
/// commits to the body payload. Two headers are equal exactly when their
/// hashes are equal.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(any(test, feature = "proptest-impl"), derive(Arbitrary))]
pub struct Hash(pub [u8; 32]);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("block::Hash")
            .field(&hex::encode(self.0))
            .finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The short form is enough to identify a block in logs.
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl<'a> From<&'a Header> for Hash {
    fn from(header: &'a Header) -> Self {
        let first = Sha256::digest(header.canonical_bytes());
        let second = Sha256::digest(first);
        Self(second.into())
    }
}

/// An error parsing a [`Hash`] from its hex representation.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("invalid block hash: expected 64 hex characters")]
pub struct ParseHashError;

impl std::str::FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0; 32];
        if hex::decode_to_slice(s, &mut bytes[..]).is_err() {
            Err(ParseHashError)
        } else {
            Ok(Hash(bytes))
        }
    }
}
