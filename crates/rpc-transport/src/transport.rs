//! Abstract transport layer: a single interface over plain TCP and
//! TLS-wrapped TCP, so `rpc-client` and `rpc-server` never branch on which
//! one is in use.

use async_trait::async_trait;

use crate::error::Result;
use crate::frame::Frame;

/// Establishes outbound connections and accepts inbound ones.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to a remote peer, subject to the transport's configured
    /// connect timeout.
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>>;

    /// Bind and listen for incoming connections.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>>;
}

/// An established, bidirectional, frame-oriented connection.
///
/// A single connection multiplexes many in-flight requests by `req_id`, so
/// reads and writes are independently synchronized: concurrent `send_frame`
/// calls are serialized internally (single writer), and `recv_frame` is
/// driven by one owning read loop.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one frame. Implementations must write the header and body as a
    /// single logical operation so frames never interleave on the wire.
    async fn send_frame(&self, frame: &Frame) -> Result<()>;

    /// Block until the next complete frame has been read.
    async fn recv_frame(&self) -> Result<Frame>;

    /// Remote peer address, for logging.
    fn peer_addr(&self) -> &str;

    /// Local address, for logging.
    fn local_addr(&self) -> &str;

    /// Close the underlying socket. Best-effort; errors are not actionable.
    async fn close(&self);
}

/// Accepts inbound connections on a bound address.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept the next inbound connection, performing a TLS handshake first
    /// if this listener requires one.
    async fn accept(&self) -> Result<Box<dyn Connection>>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> Result<String>;
}
