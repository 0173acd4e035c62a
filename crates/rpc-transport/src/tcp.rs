//! Plain (non-TLS) TCP transport.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::error::{Result, TransportError};
use crate::frame::Frame;
use crate::transport::{Connection, Listener, Transport};

/// Configuration for plain TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Wall-clock deadline for `connect()`, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to set `TCP_NODELAY` (disable Nagle's algorithm).
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self { connect_timeout_ms: 5_000, nodelay: true }
    }
}

/// Plain TCP transport.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let timeout = std::time::Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|source| TransportError::ConnectFailed { addr: addr.to_string(), source })?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr, "tcp connected");
        Ok(Box::new(TcpConnection::from_stream(stream)?))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::debug!(addr, "tcp listening");
        Ok(Box::new(TcpListenerImpl { inner: listener, nodelay: self.config.nodelay }))
    }
}

/// A single plain TCP connection, split so reads and writes can proceed
/// concurrently; each half is independently mutex-guarded to serialize
/// concurrent callers without blocking the opposite direction.
pub struct TcpConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
    peer_addr: String,
    local_addr: String,
}

impl TcpConnection {
    pub(crate) fn from_stream(stream: tokio::net::TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let local_addr = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let (read, write) = stream.into_split();
        Ok(Self { read: Mutex::new(read), write: Mutex::new(write), peer_addr, local_addr })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut write = self.write.lock().await;
        frame.write_to(&mut *write).await
    }

    async fn recv_frame(&self) -> Result<Frame> {
        let mut read = self.read.lock().await;
        Frame::read_from(&mut *read).await
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }

    async fn close(&self) {
        let mut write = self.write.lock().await;
        let _ = write.shutdown().await;
    }
}

struct TcpListenerImpl {
    inner: tokio::net::TcpListener,
    nodelay: bool,
}

#[async_trait]
impl Listener for TcpListenerImpl {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, peer_addr) = self.inner.accept().await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(peer = %peer_addr, "tcp accepted");
        Ok(Box::new(TcpConnection::from_stream(stream)?))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ReqKind;

    #[tokio::test]
    async fn send_and_receive_a_frame() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame.body, b"ping");
            let response = Frame::new(ReqKind::RpcResponse, frame.req_id, b"pong".to_vec());
            conn.send_frame(&response).await.unwrap();
        });

        let conn = transport.connect(&addr).await.unwrap();
        conn.send_frame(&Frame::new(ReqKind::RpcRequest, 1, b"ping".to_vec())).await.unwrap();
        let response = conn.recv_frame().await.unwrap();
        assert_eq!(response.body, b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_times_out_against_an_unroutable_address() {
        let config = TcpTransportConfig { connect_timeout_ms: 50, ..Default::default() };
        let transport = TcpTransport::new(config);
        let err = transport.connect("10.255.255.1:9").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectTimeout { .. }));
    }
}
