//! Peer-related errors.

use std::borrow::Cow;

use thiserror::Error;

/// An error carried by a peer response future.
#[derive(Error, Debug, Clone)]
pub enum PeerError {
    /// The remote peer closed the connection.
    #[error("peer closed connection")]
    ConnectionClosed,

    /// The connection was dropped on our side.
    #[error("internal connection dropped")]
    ConnectionDropped,

    /// The transport's own request deadline elapsed.
    #[error("receiving peer response timed out")]
    ResponseTimeout,

    /// The peer sent a response that could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(Cow<'static, str>),
}
