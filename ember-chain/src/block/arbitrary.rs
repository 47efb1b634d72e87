//! Test-only strategies and deterministic builders for block types.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::{Body, Hash, Header, Height};

/// Build a deterministic, correctly-linked header chain.
///
/// Returns `len` headers with numbers `start..start + len`, where the
/// first header's parent is `parent_hash` and every later header's parent
/// is its predecessor. Each header commits to the body produced by
/// [`body_for`].
pub fn header_chain(parent_hash: Hash, start: Height, len: usize) -> Vec<Arc<Header>> {
    let mut chain = Vec::with_capacity(len);
    let mut parent_hash = parent_hash;

    for offset in 0..len as u64 {
        let number = Height(start.0 + offset);
        let body = deterministic_body(number);

        let header = Arc::new(Header {
            parent_hash,
            number,
            payload_root: body_root(&body),
            nonce: number.0.wrapping_mul(0x9e37_79b9_7f4a_7c15),
            time: 1_700_000_000 + number.0 as u32 * 15,
        });

        parent_hash = header.hash();
        chain.push(header);
    }

    chain
}

/// The deterministic body committed to by a [`header_chain`] header.
pub fn body_for(header: &Header) -> Body {
    deterministic_body(header.number)
}

fn deterministic_body(number: Height) -> Body {
    let mut payload = number.0.to_le_bytes().to_vec();
    payload.resize(8 + (number.0 % 7) as usize, 0xeb);
    Body(payload)
}

fn body_root(body: &Body) -> Hash {
    let first = Sha256::digest(&body.0);
    Hash(Sha256::digest(first).into())
}
