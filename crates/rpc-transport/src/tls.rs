//! TLS-wrapped TCP transport.
//!
//! Certificate material is loaded once at construction time into a
//! `rustls::ClientConfig`/`ServerConfig`; there is no support for rotating
//! certificates on a live transport — build a new `TlsTransport` instead.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Mutex;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Result, TransportError};
use crate::frame::Frame;
use crate::transport::{Connection, Listener, Transport};

/// Certificate material and verification policy for a TLS transport.
///
/// Built once from files on disk (server side) or a CA bundle to verify
/// against (client side), then passed into [`TlsTransport::new`] — the
/// same shape an installable "TLS context" callback would configure.
#[derive(Clone)]
pub struct TlsConfig {
    /// PEM-encoded trust anchors used to verify the peer's certificate.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded certificate chain presented to the peer. Required for a
    /// listener; optional for a client unless the server requires mTLS.
    pub cert_chain_pem: Option<Vec<u8>>,
    /// PEM-encoded private key matching `cert_chain_pem`.
    pub private_key_pem: Option<Vec<u8>>,
    /// Whether an acceptor should require and verify a client certificate.
    pub require_client_auth: bool,
}

impl TlsConfig {
    fn root_store(&self) -> Result<rustls::RootCertStore> {
        let mut store = rustls::RootCertStore::empty();
        let mut cursor = io::Cursor::new(&self.ca_cert_pem);
        for cert in certs(&mut cursor) {
            let cert = cert.map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
            store
                .add(cert)
                .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
        }
        Ok(store)
    }

    fn cert_chain(&self) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
        let pem = self.cert_chain_pem.as_ref().ok_or_else(|| TransportError::TlsError {
            reason: "no certificate chain configured".to_string(),
        })?;
        let mut cursor = io::Cursor::new(pem);
        certs(&mut cursor)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TransportError::TlsError { reason: e.to_string() })
    }

    fn private_key(&self) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
        let pem = self.private_key_pem.as_ref().ok_or_else(|| TransportError::TlsError {
            reason: "no private key configured".to_string(),
        })?;
        let mut cursor = io::Cursor::new(pem);
        let mut keys = pkcs8_private_keys(&mut cursor);
        let key = keys
            .next()
            .ok_or_else(|| TransportError::TlsError { reason: "no PKCS8 key found in PEM".to_string() })?
            .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
        Ok(rustls::pki_types::PrivateKeyDer::Pkcs8(key))
    }

    fn client_rustls_config(&self) -> Result<rustls::ClientConfig> {
        let roots = self.root_store()?;
        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let config = if self.cert_chain_pem.is_some() {
            builder
                .with_client_auth_cert(self.cert_chain()?, self.private_key()?)
                .map_err(|e| TransportError::TlsError { reason: e.to_string() })?
        } else {
            builder.with_no_client_auth()
        };
        Ok(config)
    }

    fn server_rustls_config(&self) -> Result<rustls::ServerConfig> {
        let chain = self.cert_chain()?;
        let key = self.private_key()?;
        let builder = rustls::ServerConfig::builder();
        let config = if self.require_client_auth {
            let roots = Arc::new(self.root_store()?);
            let verifier = rustls::server::WebPkiClientVerifier::builder(roots)
                .build()
                .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)
                .map_err(|e| TransportError::TlsError { reason: e.to_string() })?
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(chain, key)
                .map_err(|e| TransportError::TlsError { reason: e.to_string() })?
        };
        Ok(config)
    }
}

/// TLS-wrapped TCP transport. Connects are client handshakes; listens
/// perform a server handshake on each accepted socket before the connection
/// is handed back, so a peer never observes a connection before it is
/// fully encrypted.
pub struct TlsTransport {
    config: TlsConfig,
    connect_timeout_ms: u64,
}

impl TlsTransport {
    /// Build a transport from certificate material. `connect_timeout_ms`
    /// bounds the TCP handshake only, not the TLS handshake on top of it.
    pub fn new(config: TlsConfig, connect_timeout_ms: u64) -> Self {
        Self { config, connect_timeout_ms }
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Connection>> {
        let timeout = std::time::Duration::from_millis(self.connect_timeout_ms);
        let tcp = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: self.connect_timeout_ms,
            })?
            .map_err(|source| TransportError::ConnectFailed { addr: addr.to_string(), source })?;
        let peer_addr = tcp.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let local_addr = tcp.local_addr().map(|a| a.to_string()).unwrap_or_default();

        let rustls_config = Arc::new(self.config.client_rustls_config()?);
        let connector = TlsConnector::from(rustls_config);
        let server_name = addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(addr)
            .to_string();
        let dns_name = rustls::pki_types::ServerName::try_from(server_name)
            .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
        let stream = connector
            .connect(dns_name, tcp)
            .await
            .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;

        tracing::debug!(addr, "tls client handshake complete");
        Ok(Box::new(TlsConnection::new(TlsStream::Client(stream), peer_addr, local_addr)))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let rustls_config = Arc::new(self.config.server_rustls_config()?);
        let acceptor = TlsAcceptor::from(rustls_config);
        tracing::debug!(addr, "tls listening");
        Ok(Box::new(TlsListenerImpl { inner: listener, acceptor }))
    }
}

struct TlsListenerImpl {
    inner: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl Listener for TlsListenerImpl {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (tcp, peer) = self.inner.accept().await?;
        let peer_addr = peer.to_string();
        let local_addr = tcp.local_addr().map(|a| a.to_string()).unwrap_or_default();
        let stream = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
        tracing::debug!(peer = %peer_addr, "tls server handshake complete");
        Ok(Box::new(TlsConnection::new(TlsStream::Server(stream), peer_addr, local_addr)))
    }

    fn local_addr(&self) -> Result<String> {
        Ok(self.inner.local_addr()?.to_string())
    }
}

/// A connected TLS stream, either client- or server-side of the handshake.
/// `rustls`'s client and server stream types differ, so this enum lets a
/// single [`TlsConnection`] wrap either without a trait object per poll call.
enum TlsStream {
    Client(tokio_rustls::client::TlsStream<tokio::net::TcpStream>),
    Server(tokio_rustls::server::TlsStream<tokio::net::TcpStream>),
}

impl AsyncRead for TlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TlsStream::Client(s) => Pin::new(s).poll_read(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TlsStream::Client(s) => Pin::new(s).poll_write(cx, buf),
            TlsStream::Server(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TlsStream::Client(s) => Pin::new(s).poll_flush(cx),
            TlsStream::Server(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TlsStream::Client(s) => Pin::new(s).poll_shutdown(cx),
            TlsStream::Server(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A TLS connection. Unlike [`crate::tcp::TcpConnection`], the stream isn't
/// split by the OS socket API, so both directions share one mutex-guarded
/// stream; this still serializes concurrent writers correctly because reads
/// and writes are issued from disjoint call sites (one reader loop, one
/// writer at a time).
struct TlsConnection {
    stream: Mutex<TlsStream>,
    peer_addr: String,
    local_addr: String,
}

impl TlsConnection {
    fn new(stream: TlsStream, peer_addr: String, local_addr: String) -> Self {
        Self { stream: Mutex::new(stream), peer_addr, local_addr }
    }
}

#[async_trait]
impl Connection for TlsConnection {
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut stream = self.stream.lock().await;
        frame.write_to(&mut *stream).await
    }

    async fn recv_frame(&self) -> Result<Frame> {
        let mut stream = self.stream.lock().await;
        Frame::read_from(&mut *stream).await
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }

    async fn close(&self) {
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
    }
}

/// Generates a self-signed CA and a leaf certificate signed by it, for
/// tests and local development. Not part of the wire protocol; callers in
/// production are expected to supply real certificate material.
pub fn generate_self_signed_pair(subject_alt_name: &str) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_key = rcgen::KeyPair::generate().map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;

    let leaf_key =
        rcgen::KeyPair::generate().map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
    let leaf_params = rcgen::CertificateParams::new(vec![subject_alt_name.to_string()])
        .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .map_err(|e| TransportError::TlsError { reason: e.to_string() })?;

    Ok((ca_cert.pem().into_bytes(), leaf_cert.pem().into_bytes(), leaf_key.serialize_pem().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ReqKind;

    #[tokio::test]
    async fn handshakes_and_exchanges_a_frame() {
        let (ca_pem, leaf_pem, key_pem) = generate_self_signed_pair("localhost").unwrap();

        let server_config = TlsConfig {
            ca_cert_pem: ca_pem.clone(),
            cert_chain_pem: Some(leaf_pem.clone()),
            private_key_pem: Some(key_pem.clone()),
            require_client_auth: false,
        };
        let client_config = TlsConfig {
            ca_cert_pem: ca_pem,
            cert_chain_pem: None,
            private_key_pem: None,
            require_client_auth: false,
        };

        let server_transport = TlsTransport::new(server_config, 5_000);
        let listener = server_transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let frame = conn.recv_frame().await.unwrap();
            assert_eq!(frame.body, b"hello-tls");
            let response = Frame::new(ReqKind::RpcResponse, frame.req_id, b"ack".to_vec());
            conn.send_frame(&response).await.unwrap();
        });

        let client_transport = TlsTransport::new(client_config, 5_000);
        let conn = client_transport.connect(&format!("localhost:{}", addr.rsplit(':').next().unwrap())).await.unwrap();
        conn.send_frame(&Frame::new(ReqKind::RpcRequest, 1, b"hello-tls".to_vec())).await.unwrap();
        let response = conn.recv_frame().await.unwrap();
        assert_eq!(response.body, b"ack");

        server.await.unwrap();
    }
}
