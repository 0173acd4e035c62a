//! Server-side error types.

use thiserror::Error;

/// Errors from decoding or invoking a registered handler. These never
/// propagate to a caller directly — the dispatcher turns them into an
/// `RpcResponse` with a non-zero status rather than closing the connection.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// No handler is registered under this name.
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    /// The request body failed to decode as the handler's argument tuple.
    #[error("decode error: {0}")]
    Decode(String),
    /// The handler itself reported a failure.
    #[error("handler error: {0}")]
    Handler(String),
}

/// Errors from operating the server itself (registration, binding, TLS setup).
#[derive(Error, Debug)]
pub enum ServerError {
    /// `register_handler`/`register_handler_async` called after `run()`.
    #[error("server is already running; handlers must be registered before run()")]
    AlreadyRunning,
    /// Transport-level failure (bind, accept, TLS).
    #[error("transport error: {0}")]
    Transport(#[from] rpc_transport::TransportError),
    /// Failure reading certificate/key material from disk.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
