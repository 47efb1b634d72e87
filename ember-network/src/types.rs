//! Small value types shared across the networking seam.

use std::{fmt, sync::Arc};

use ember_chain::block::{Block, Hash, Header, Height};

/// The node identity of a remote peer.
///
/// A value type: callbacks that outlive a dispatch carry the `PeerId` and
/// re-resolve it to a live handle through the pool when they need one.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&hex::encode(self.0)).finish()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

/// A header annotated with the peer it was received from.
///
/// The receipt attribution is used to drop the peer if the header later
/// turns out to be corrupt, and to prefer the originating peer when
/// fetching a fresh block body.
#[derive(Clone, Debug)]
pub struct HeaderWrapper {
    header: Arc<Header>,
    hash: Hash,
    from: PeerId,
}

impl HeaderWrapper {
    /// Wrap a received header, caching its hash.
    pub fn new(header: Arc<Header>, from: PeerId) -> Self {
        let hash = header.hash();
        Self { header, hash, from }
    }

    /// The wrapped header.
    pub fn header(&self) -> &Arc<Header> {
        &self.header
    }

    /// The cached hash of the wrapped header.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The number of the wrapped header.
    pub fn number(&self) -> Height {
        self.header.number
    }

    /// The parent hash of the wrapped header.
    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    /// The peer this header was received from.
    pub fn from(&self) -> PeerId {
        self.from
    }
}

/// A block annotated with the peer it was received from.
#[derive(Clone, Debug)]
pub struct BlockWrapper {
    block: Arc<Block>,
    from: PeerId,
}

impl BlockWrapper {
    /// Wrap a received block.
    pub fn new(block: Arc<Block>, from: PeerId) -> Self {
        Self { block, from }
    }

    /// The wrapped block.
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// The height of the wrapped block.
    pub fn height(&self) -> Height {
        self.block.height()
    }

    /// The peer this block was received from.
    pub fn from(&self) -> PeerId {
        self.from
    }
}
