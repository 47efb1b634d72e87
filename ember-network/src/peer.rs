//! The handle through which the pipeline talks to a single remote peer.

mod error;

pub use error::PeerError;

use futures::future::BoxFuture;

use ember_chain::block::{Block, Hash, Header, Height};

use crate::{HeaderWrapper, PeerId};

/// The response future for an in-flight header request.
pub type HeadersResponseFuture = BoxFuture<'static, Result<Vec<Header>, PeerError>>;

/// The response future for an in-flight block body request.
pub type BodiesResponseFuture = BoxFuture<'static, Result<Vec<Block>, PeerError>>;

/// A live connection to a remote peer, scoped to the requests the sync
/// pipeline needs.
///
/// Handles may become invalid at any time: every send returns `None` when
/// the peer can no longer carry the request, and the caller is expected to
/// retry elsewhere. Sends must not block; the returned future resolves
/// when the response (or a transport error) arrives.
pub trait PeerHandle: Send + Sync + 'static {
    /// The node identity that owns this handle.
    fn node_id(&self) -> PeerId;

    /// Request `count` headers starting at block number `start`.
    ///
    /// Returns `None` if the peer is gone.
    fn send_get_block_headers(
        &self,
        start: Height,
        count: u32,
        reverse: bool,
    ) -> Option<HeadersResponseFuture>;

    /// Request a skip-list of headers anchored at the header with hash
    /// `anchor`, with `step` blocks between consecutive headers.
    ///
    /// Returns `None` if the peer is gone.
    fn send_get_block_headers_by_hash(
        &self,
        anchor: Hash,
        count: u32,
        step: u32,
        reverse: bool,
    ) -> Option<HeadersResponseFuture>;

    /// Request the bodies for `headers`, returned as whole blocks.
    ///
    /// Returns `None` if the peer is gone.
    fn send_get_block_bodies(&self, headers: Vec<HeaderWrapper>) -> Option<BodiesResponseFuture>;

    /// Sever this peer's connection.
    ///
    /// The owning pool observes the drop and stops returning the peer from
    /// [`PeerPool::any_idle`](crate::PeerPool::any_idle).
    fn drop_connection(&self);
}
