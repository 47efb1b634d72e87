//! The pool abstraction over "the rest of the network".
//!
//! The pool is maintained by the embedding application's peer management;
//! the sync pipeline only consumes it. A peer is *idle* when it is not
//! currently servicing a request from this subsystem, so the pipeline can
//! hold at most one in-flight request per peer.

#[cfg(any(test, feature = "proptest-impl"))]
pub(crate) mod mock;

use std::sync::Arc;

use crate::{PeerError, PeerHandle, PeerId};

/// A source of idle peers for the sync pipeline.
///
/// Implementations must be safe under concurrent access: the header and
/// body workers call into the pool in parallel, and completion callbacks
/// re-resolve handles from arbitrary tasks.
pub trait PeerPool: Send + Sync + 'static {
    /// The peer handle type this pool hands out.
    type Handle: PeerHandle + ?Sized;

    /// Returns some idle peer, or `None` when every peer is busy or gone.
    fn any_idle(&self) -> Option<Arc<Self::Handle>>;

    /// Looks up a specific peer by its node identity.
    ///
    /// Returns `None` if the peer has disconnected or was dropped.
    fn by_node_id(&self, id: &PeerId) -> Option<Arc<Self::Handle>>;

    /// Close the pool, severing every remaining connection.
    ///
    /// Closing may fail partway through teardown; callers that are
    /// shutting down anyway are expected to log and continue.
    fn close(&self) -> Result<(), PeerError>;
}
