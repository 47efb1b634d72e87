//! Peer abstractions for Ember's block download pipeline.
//!
//! This crate defines the seam between the sync pipeline and the wire
//! layer: a [`PeerHandle`] is a live connection that can carry header and
//! body requests, and a [`PeerPool`] hands out idle handles. The wire
//! codec and the peer handshake live behind these traits; the pipeline
//! never sees them.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod peer;
mod peer_set;
mod types;

pub use peer::{BodiesResponseFuture, HeadersResponseFuture, PeerError, PeerHandle};
pub use peer_set::PeerPool;
pub use types::{BlockWrapper, HeaderWrapper, PeerId};

#[cfg(any(test, feature = "proptest-impl"))]
pub use peer_set::mock::{MockChain, MockPeer, MockPeerPool, PeerBehavior};
