//! Transport-level error types shared by the client and server crates.

use thiserror::Error;

/// Errors that can occur establishing or operating a transport-level connection.
#[derive(Error, Debug)]
pub enum TransportError {
    /// TCP or TLS connection establishment failed.
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        /// Address that was being connected to.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The connection attempt did not complete before the configured deadline.
    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Address that was being connected to.
        addr: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The socket was closed, either by the peer or by a local `close()`.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame's header failed validation (short read, oversized body, bad framing).
    #[error("protocol error: {reason}")]
    ProtocolError {
        /// Human-readable description of the framing violation.
        reason: String,
    },

    /// TLS handshake or certificate-loading error.
    #[error("TLS error: {reason}")]
    TlsError {
        /// Description of the TLS failure.
        reason: String,
    },

    /// Codec-level (de)serialization failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O error not otherwise classified above.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
