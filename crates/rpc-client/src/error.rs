//! Client-observable error types.

use rpc_transport::TransportError;
use thiserror::Error;

/// Errors surfaced to a caller of [`crate::ClientSession`].
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Transport-level failure (connect, I/O, TLS, framing).
    #[error("transport error: {0}")]
    Transport(String),

    /// The request's deadline elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// The connection was closed, either by the peer, a dead-connection
    /// detection, or an explicit `close()`.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server returned a non-success status with an error message.
    #[error("server error: {0}")]
    ServerError(String),

    /// A reply payload failed to decode as the caller's requested type.
    #[error("decode error: {0}")]
    Decode(String),

    /// The framework was asked to operate before `connect()` succeeded.
    #[error("not connected")]
    NotConnected,
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::ConnectTimeout { .. } => ClientError::Transport(e.to_string()),
            TransportError::ConnectionClosed => ClientError::ConnectionClosed,
            other => ClientError::Transport(other.to_string()),
        }
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
