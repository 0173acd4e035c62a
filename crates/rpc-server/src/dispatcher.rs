//! The accept loop, per-connection read loop, and handler dispatch.
//!
//! The accept loop spawns one task per connection (frame-in/frame-out),
//! with active-request/total-dispatched/total-error counters tracked
//! alongside. Concurrency is bounded by a semaphore sized to
//! `ServerConfig::worker_threads` rather than a hand-rolled thread pool,
//! favoring tokio-native concurrency primitives throughout.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rpc_transport::{
    BincodeCodec, Codec, Frame, Listener, ReqKind, TcpTransport, TcpTransportConfig, TlsConfig,
    TlsTransport, Transport,
};
use tokio::sync::{Mutex, Semaphore};

use crate::broker::{Broker, BrokerStats};
use crate::context::ConnectionContext;
use crate::connection::ConnectionHandle;
use crate::error::{DispatchError, Result, ServerError};
use crate::registry::{error_body, HandlerRegistry};

/// Certificate and key file paths for server-side TLS.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    /// PEM certificate chain path.
    pub cert_path: PathBuf,
    /// PEM private key path.
    pub key_path: PathBuf,
}

/// Tunables for a [`Server`]. One concern per config struct rather than a
/// single monolithic options bag.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind; defaults to all interfaces.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Upper bound on concurrently executing handler invocations, sized by
    /// host concurrency when left at the default.
    pub worker_threads: usize,
    /// Server-side TLS material. `None` means plain TCP.
    pub tls: Option<TlsPaths>,
    /// Deadline for the TCP handshake on an inbound TLS connection. Only
    /// meaningful when `tls` is set; accept itself has no timeout.
    pub tls_handshake_timeout_ms: u64,
}

impl ServerConfig {
    /// Convenience constructor matching the framework's abstract surface:
    /// port, worker count, and an optional TLS cert/key pair.
    pub fn new(port: u16, worker_threads: usize, tls: Option<TlsPaths>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port,
            worker_threads: worker_threads.max(1),
            tls,
            tls_handshake_timeout_ms: 10_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            0,
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            None,
        )
    }
}

/// Snapshot of server-wide activity, for health/readiness logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    /// Handler invocations currently executing.
    pub active_requests: usize,
    /// Total requests dispatched since startup.
    pub total_dispatched: u64,
    /// Total requests that produced an error response.
    pub total_errors: u64,
    /// Broker occupancy.
    pub broker: BrokerStats,
}

/// Owns the handler registry, the pub/sub broker, and the accept loop.
///
/// Registration (`register_handler`/`register_handler_async`) is only
/// permitted before [`Server::run`] is called; `run` takes the registry out
/// of its building state and shares it read-only across every connection
/// for the remainder of the process.
pub struct Server<C: Codec = BincodeCodec> {
    config: ServerConfig,
    codec: Arc<C>,
    registry: Mutex<Option<HandlerRegistry<C>>>,
    broker: Arc<Broker>,
    active_requests: AtomicUsize,
    total_dispatched: AtomicU64,
    total_errors: AtomicU64,
}

impl Server<BincodeCodec> {
    /// Creates a server using the default bincode codec: `port`, a worker
    /// count bounding concurrent handler invocations, and optional TLS
    /// certificate/key paths.
    pub fn new(port: u16, worker_threads: usize, tls: Option<TlsPaths>) -> Self {
        Self::with_config(ServerConfig::new(port, worker_threads, tls))
    }

    /// Creates a server from a full [`ServerConfig`].
    pub fn with_config(config: ServerConfig) -> Self {
        Self::with_codec(config, BincodeCodec)
    }
}

impl<C: Codec> Server<C> {
    /// Creates a server using a caller-supplied codec instead of the
    /// default bincode implementation.
    pub fn with_codec(config: ServerConfig, codec: C) -> Self {
        let codec = Arc::new(codec);
        Self {
            config,
            codec: codec.clone(),
            registry: Mutex::new(Some(HandlerRegistry::new(codec))),
            broker: Arc::new(Broker::new()),
            active_requests: AtomicUsize::new(0),
            total_dispatched: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }
}

impl<C: Codec> Server<C> {
    /// Registers a synchronous handler. See
    /// [`HandlerRegistry::register_handler`]. Fails with
    /// [`ServerError::AlreadyRunning`] once [`Server::run`] has started.
    pub async fn register_handler<F, Fut, Args, Ret>(&self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(ConnectionContext<C>, Args) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<Ret, String>> + Send + 'static,
        Args: serde::de::DeserializeOwned + Send + 'static,
        Ret: serde::Serialize + Send + 'static,
    {
        let mut guard = self.registry.lock().await;
        let registry = guard.as_mut().ok_or(ServerError::AlreadyRunning)?;
        registry.register_handler(name, handler);
        Ok(())
    }

    /// Registers an async (deferred-response) handler. See
    /// [`HandlerRegistry::register_handler_async`].
    pub async fn register_handler_async<F, Fut, Args>(&self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(ConnectionContext<C>, Args) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
        Args: serde::de::DeserializeOwned + Send + 'static,
    {
        let mut guard = self.registry.lock().await;
        let registry = guard.as_mut().ok_or(ServerError::AlreadyRunning)?;
        registry.register_handler_async(name, handler);
        Ok(())
    }

    /// Delivers `payload` under `key` to every subscriber of `key`.
    pub async fn publish(&self, key: &str, payload: Vec<u8>) -> usize {
        self.broker.publish(self.codec.as_ref(), key, payload).await
    }

    /// Delivers `payload` under `key` only to subscribers whose token
    /// equals `token`.
    pub async fn publish_by_token(&self, key: &str, token: &str, payload: Vec<u8>) -> usize {
        self.broker.publish_by_token(self.codec.as_ref(), key, token, payload).await
    }

    /// Every distinct subscriber token currently known to the broker.
    pub async fn get_token_list(&self) -> Vec<String> {
        self.broker.get_token_list().await
    }

    /// A snapshot of current server and broker activity.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            active_requests: self.active_requests.load(Ordering::Relaxed),
            total_dispatched: self.total_dispatched.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            broker: self.broker.stats().await,
        }
    }

    /// Binds the configured address and runs the accept loop forever (or
    /// until the listener errors). Freezes the handler registry: no
    /// further calls to `register_handler`/`register_handler_async` will
    /// succeed once this returns its bound listener.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let (_addr, accept_loop) = self.bind_and_prepare().await?;
        accept_loop.await
    }

    /// Binds the configured address, spawns the accept loop in the
    /// background, and returns the bound address immediately. Useful when
    /// the caller configured port `0` and needs to learn the ephemeral
    /// port before handing it to clients (tests, co-located harnesses).
    pub async fn serve(self: Arc<Self>) -> Result<(String, tokio::task::JoinHandle<Result<()>>)> {
        let (addr, accept_loop) = self.bind_and_prepare().await?;
        Ok((addr, tokio::spawn(accept_loop)))
    }

    async fn bind_and_prepare(
        self: Arc<Self>,
    ) -> Result<(String, impl std::future::Future<Output = Result<()>>)> {
        let registry = {
            let mut guard = self.registry.lock().await;
            let registry = guard.take().ok_or(ServerError::AlreadyRunning)?;
            Arc::new(registry)
        };

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = self.bind(&addr).await?;
        let bound_addr = listener.local_addr()?;
        tracing::info!(addr = %bound_addr, "rpc server listening");

        let semaphore = Arc::new(Semaphore::new(self.config.worker_threads));
        let server = self.clone();
        let accept_loop = async move { server.accept_loop(listener, registry, semaphore).await };
        Ok((bound_addr, accept_loop))
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: Box<dyn Listener>,
        registry: Arc<HandlerRegistry<C>>,
        semaphore: Arc<Semaphore>,
    ) -> Result<()> {
        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let handle = ConnectionHandle::spawn(Arc::from(conn));
            let server = self.clone();
            let registry = registry.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                server.serve_connection(handle, registry, semaphore).await;
            });
        }
    }

    async fn bind(&self, addr: &str) -> Result<Box<dyn Listener>> {
        match &self.config.tls {
            None => {
                let transport = TcpTransport::new(TcpTransportConfig::default());
                Ok(transport.listen(addr).await?)
            }
            Some(paths) => {
                let cert_chain_pem = tokio::fs::read(&paths.cert_path).await?;
                let private_key_pem = tokio::fs::read(&paths.key_path).await?;
                let tls_config = TlsConfig {
                    ca_cert_pem: Vec::new(),
                    cert_chain_pem: Some(cert_chain_pem),
                    private_key_pem: Some(private_key_pem),
                    require_client_auth: false,
                };
                let transport = TlsTransport::new(tls_config, self.config.tls_handshake_timeout_ms);
                Ok(transport.listen(addr).await?)
            }
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        handle: Arc<ConnectionHandle>,
        registry: Arc<HandlerRegistry<C>>,
        semaphore: Arc<Semaphore>,
    ) {
        let peer = handle.peer_addr().to_string();
        tracing::debug!(peer, "connection accepted");

        loop {
            // recv_frame isn't exposed on ConnectionHandle (writes are
            // queued, reads are not) so the read loop talks to the
            // underlying transport directly; ConnectionHandle only owns
            // the write-serialization side.
            let frame = match handle.recv_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!(peer, error = %e, "connection closed");
                    break;
                }
            };

            match frame.req_type {
                ReqKind::RpcRequest => {
                    let server = self.clone();
                    let registry = registry.clone();
                    let handle = handle.clone();
                    let permit = semaphore.clone().acquire_owned().await.ok();
                    tokio::spawn(async move {
                        let _permit = permit;
                        server.dispatch_request(frame, registry, handle).await;
                    });
                }
                ReqKind::SubscribeRequest => {
                    self.handle_subscribe(&frame, &handle).await;
                }
                ReqKind::Heartbeat => {
                    tracing::trace!(peer, "heartbeat received");
                }
                ReqKind::PublishRequest => {
                    tracing::debug!(peer, "ignoring unsolicited publish frame from client");
                }
                ReqKind::RpcResponse => {
                    tracing::warn!(peer, "protocol error: client sent a response frame, closing");
                    break;
                }
            }
        }

        self.broker.purge(&Arc::downgrade(&handle)).await;
        handle.close().await;
    }

    async fn handle_subscribe(&self, frame: &Frame, handle: &Arc<ConnectionHandle>) {
        let decoded: std::result::Result<(String, String), _> = self.codec.unpack(&frame.body);
        match decoded {
            Ok((key, token)) => {
                let token = if token.is_empty() { None } else { Some(token) };
                self.broker.subscribe(key, token, Arc::downgrade(handle)).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode subscribe request");
            }
        }
    }

    async fn dispatch_request(
        self: Arc<Self>,
        frame: Frame,
        registry: Arc<HandlerRegistry<C>>,
        handle: Arc<ConnectionHandle>,
    ) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        self.total_dispatched.fetch_add(1, Ordering::Relaxed);

        let req_id = frame.req_id;
        let (name, consumed) = match self.codec.unpack_prefix::<String>(&frame.body) {
            Ok(pair) => pair,
            Err(e) => {
                self.respond_error(req_id, &handle, &DispatchError::Decode(e.to_string()).to_string()).await;
                self.active_requests.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        };
        let args_body = frame.body[consumed..].to_vec();

        let Some(h) = registry.lookup(&name) else {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
            self.respond_error(req_id, &handle, &DispatchError::UnknownMethod(name).to_string()).await;
            self.active_requests.fetch_sub(1, Ordering::Relaxed);
            return;
        };

        let ctx = ConnectionContext::new(Arc::downgrade(&handle), req_id, self.codec.clone());
        let outcome = (h.invoke)(ctx, args_body).await;

        // A sync handler's outcome is always Some and becomes the response.
        // An async handler's invoker only ever returns Some for a
        // pre-invocation dispatch failure (an argument decode error) — its
        // eventual success response, if any, is emitted later via
        // ConnectionContext::pack_and_response, never through `outcome`.
        if let Some(body) = outcome {
            if body.first() != Some(&0) {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
            }
            handle.enqueue_response(Frame::new(ReqKind::RpcResponse, req_id, body)).await;
        }

        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    async fn respond_error(&self, req_id: u64, handle: &Arc<ConnectionHandle>, message: &str) {
        tracing::debug!(req_id, message, "responding with error");
        let body = error_body(self.codec.as_ref(), message);
        handle.enqueue_response(Frame::new(ReqKind::RpcResponse, req_id, body)).await;
    }
}
