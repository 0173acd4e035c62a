//! The client session: one transport connection, the in-flight request
//! table, the subscribe table, and the reconnect/heartbeat background
//! tasks.
//!
//! An atomic id counter and a mutex-guarded pending table back all three
//! call shapes; a spawned reader task resolves table entries as responses
//! arrive, with `tokio::time::timeout` guarding the synchronous call path.
//! Reconnect, heartbeat, and TLS dialing build on top of that core loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rpc_transport::{BincodeCodec, Codec, Connection, Frame, ReqKind, TcpTransport, TcpTransportConfig, TlsConfig, TlsTransport, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::call::RawResult;
use crate::error::{ClientError, Result};
use crate::request_table::{RequestTable, Waiter, WaiterSink};
use crate::subscribe::{SubscribeCallback, SubscribeTable};

/// Tunables for a [`ClientSession`]. One concern per config struct rather
/// than a single monolithic options bag.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default per-call timeout when a call doesn't override it, in
    /// milliseconds. 0 means "no timeout."
    pub default_timeout_ms: u64,
    /// Interval between heartbeat frames when auto-heartbeat is enabled.
    pub heartbeat_interval_ms: u64,
    /// Starting backoff between reconnect attempts.
    pub reconnect_initial_backoff_ms: u64,
    /// Ceiling the reconnect backoff will not exceed.
    pub reconnect_max_backoff_ms: u64,
    /// Deadline for establishing the TCP (and, if applicable, TLS) connection.
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            heartbeat_interval_ms: 15_000,
            reconnect_initial_backoff_ms: 200,
            reconnect_max_backoff_ms: 10_000,
            connect_timeout_ms: 5_000,
        }
    }
}

/// A handle returned by [`ClientSession::async_call_future`]. Implements
/// `Future<Output = RawResult>` so the caller can await it whenever they
/// like, independent of when the request was issued.
pub struct CallFuture(oneshot::Receiver<RawResult>);

impl Future for CallFuture {
    type Output = RawResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<RawResult> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(RawResult::err(ClientError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Clone)]
enum DialTarget {
    Plain,
    Tls(TlsConfig),
}

#[derive(Clone)]
struct Dialed {
    addr: String,
    target: DialTarget,
}

struct SessionState<C: Codec> {
    conn: RwLock<Option<Arc<dyn Connection>>>,
    request_table: RequestTable,
    subscribe_table: SubscribeTable,
    codec: C,
    config: ClientConfig,
    connected: AtomicBool,
    closing: AtomicBool,
    auto_reconnect: AtomicBool,
    auto_heartbeat: AtomicBool,
    heartbeat_running: AtomicBool,
    last_activity_ms: std::sync::atomic::AtomicU64,
    epoch: std::time::Instant,
    error_cb: Mutex<Option<Arc<dyn Fn(ClientError) + Send + Sync>>>,
    tls_context_cb: Mutex<Option<Box<dyn Fn(&mut TlsConfig) + Send + Sync>>>,
    dialed: Mutex<Option<Dialed>>,
}

impl<C: Codec> SessionState<C> {
    fn touch_activity(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    fn ms_since_activity(&self) -> u64 {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        elapsed.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    async fn notify_error(&self, err: ClientError) {
        let cb = self.error_cb.lock().await.clone();
        if let Some(cb) = cb {
            cb(err);
        }
    }
}

/// One RPC connection's worth of client state: transport, in-flight call
/// table, subscriptions, and the background tasks that keep it alive.
///
/// Generic over the codec so `pack`/`unpack` dispatch statically rather
/// than through a trait object — `Codec`'s methods are generic and so are
/// not object-safe, and static dispatch is the idiomatic fit anyway.
pub struct ClientSession<C: Codec = BincodeCodec> {
    state: Arc<SessionState<C>>,
}

impl<C: Codec> Clone for ClientSession<C> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl ClientSession<BincodeCodec> {
    /// Creates a session using the default bincode codec.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_codec(config, BincodeCodec)
    }
}

impl<C: Codec> ClientSession<C> {
    /// Creates a session using a caller-supplied codec instead of the
    /// default bincode implementation.
    pub fn with_codec(config: ClientConfig, codec: C) -> Self {
        let state = Arc::new(SessionState {
            conn: RwLock::new(None),
            request_table: RequestTable::new(),
            subscribe_table: SubscribeTable::new(),
            codec,
            config,
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            auto_reconnect: AtomicBool::new(false),
            auto_heartbeat: AtomicBool::new(false),
            heartbeat_running: AtomicBool::new(false),
            last_activity_ms: std::sync::atomic::AtomicU64::new(0),
            epoch: std::time::Instant::now(),
            error_cb: Mutex::new(None),
            tls_context_cb: Mutex::new(None),
            dialed: Mutex::new(None),
        });
        Self { state }
    }

    /// Registers a callback invoked on every transport-level error (not on
    /// a per-call timeout, which is returned directly to the caller).
    pub async fn set_error_callback(&self, cb: impl Fn(ClientError) + Send + Sync + 'static) {
        *self.state.error_cb.lock().await = Some(Arc::new(cb));
    }

    /// Registers a callback invoked once, immediately before a TLS
    /// handshake, so a caller can attach verification mode and trust roots.
    pub async fn set_tls_context_callback(&self, cb: impl Fn(&mut TlsConfig) + Send + Sync + 'static) {
        *self.state.tls_context_cb.lock().await = Some(Box::new(cb));
    }

    /// Enables auto-reconnect for the remaining lifetime of the session.
    /// A one-shot latch: calling this again has no additional effect.
    pub fn enable_auto_reconnect(&self) {
        self.state.auto_reconnect.store(true, Ordering::SeqCst);
    }

    /// Enables periodic heartbeats for the remaining lifetime of the
    /// session. If the session is already connected, starts the heartbeat
    /// task immediately; otherwise it starts the first time `connect()`
    /// succeeds.
    pub fn enable_auto_heartbeat(&self) {
        self.state.auto_heartbeat.store(true, Ordering::SeqCst);
        if self.state.connected.load(Ordering::SeqCst) {
            self.maybe_spawn_heartbeat();
        }
    }

    /// Whether the session currently holds a live connection.
    pub fn has_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Connects to `host:port`. Idempotent if already connected. Blocks
    /// until the transport (and TLS handshake, if `use_tls`) completes or
    /// `timeout` elapses.
    pub async fn connect(&self, host: &str, port: u16, use_tls: bool, timeout: Duration) -> Result<()> {
        if self.has_connected() {
            return Ok(());
        }
        let addr = format!("{host}:{port}");
        let target = if use_tls {
            let mut tls_config = TlsConfig {
                ca_cert_pem: Vec::new(),
                cert_chain_pem: None,
                private_key_pem: None,
                require_client_auth: false,
            };
            if let Some(cb) = self.state.tls_context_cb.lock().await.as_ref() {
                cb(&mut tls_config);
            }
            DialTarget::Tls(tls_config)
        } else {
            DialTarget::Plain
        };

        let connect_timeout_ms = timeout.as_millis() as u64;
        let conn = Self::dial(&addr, &target, connect_timeout_ms).await?;

        {
            let mut guard = self.state.dialed.lock().await;
            *guard = Some(Dialed { addr, target });
        }

        self.install_connection(conn).await;
        Ok(())
    }

    async fn dial(addr: &str, target: &DialTarget, connect_timeout_ms: u64) -> Result<Arc<dyn Connection>> {
        let conn: Box<dyn Connection> = match target {
            DialTarget::Plain => {
                let transport = TcpTransport::new(TcpTransportConfig { connect_timeout_ms, nodelay: true });
                transport.connect(addr).await?
            }
            DialTarget::Tls(tls_config) => {
                let transport = TlsTransport::new(tls_config.clone(), connect_timeout_ms);
                transport.connect(addr).await?
            }
        };
        Ok(Arc::from(conn))
    }

    async fn install_connection(&self, conn: Arc<dyn Connection>) {
        *self.state.conn.write().await = Some(conn.clone());
        self.state.connected.store(true, Ordering::SeqCst);
        self.state.touch_activity();

        let state = self.state.clone();
        tokio::spawn(async move {
            Self::receive_loop(state, conn).await;
        });

        self.replay_subscriptions().await;
        if self.state.auto_heartbeat.load(Ordering::SeqCst) {
            self.maybe_spawn_heartbeat();
        }
    }

    async fn replay_subscriptions(&self) {
        for (key, token) in self.state.subscribe_table.snapshot().await {
            let body = self.state.codec.pack(&(key, token.unwrap_or_default())).unwrap_or_default();
            let frame = Frame::new(ReqKind::SubscribeRequest, 0, body);
            let _ = self.send_frame(&frame).await;
        }
    }

    fn maybe_spawn_heartbeat(&self) {
        if self.state.heartbeat_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = self.state.clone();
        tokio::spawn(async move {
            Self::heartbeat_loop(state).await;
        });
    }

    async fn heartbeat_loop(state: Arc<SessionState<C>>) {
        let interval = Duration::from_millis(state.config.heartbeat_interval_ms.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if state.closing.load(Ordering::SeqCst) || !state.connected.load(Ordering::SeqCst) {
                break;
            }
            if state.ms_since_activity() > state.config.heartbeat_interval_ms.saturating_mul(3) {
                tracing::warn!("no server activity for 3 heartbeat intervals, treating connection as dead");
                if let Some(conn) = state.conn.read().await.clone() {
                    conn.close().await;
                }
                break;
            }
            let conn = state.conn.read().await.clone();
            if let Some(conn) = conn {
                let frame = Frame::new(ReqKind::Heartbeat, 0, Vec::new());
                if conn.send_frame(&frame).await.is_err() {
                    break;
                }
            } else {
                break;
            }
        }
        state.heartbeat_running.store(false, Ordering::SeqCst);
    }

    async fn receive_loop(state: Arc<SessionState<C>>, conn: Arc<dyn Connection>) {
        loop {
            match conn.recv_frame().await {
                Ok(frame) => {
                    state.touch_activity();
                    match frame.req_type {
                        ReqKind::RpcResponse => {
                            if let Some(waiter) = state.request_table.remove(frame.req_id).await {
                                let raw = Self::decode_response(&frame.body, &state.codec);
                                waiter.sink.resolve(raw);
                            }
                        }
                        ReqKind::PublishRequest => {
                            let decoded: std::result::Result<(String, String, Vec<u8>), _> =
                                state.codec.unpack(&frame.body);
                            if let Ok((key, token, payload)) = decoded {
                                let token = if token.is_empty() { None } else { Some(token.as_str()) };
                                state.subscribe_table.dispatch(&key, token, payload).await;
                            }
                        }
                        ReqKind::Heartbeat => {}
                        other => {
                            tracing::warn!(?other, "unexpected req_type on client connection, closing");
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "client receive loop ended");
                    break;
                }
            }
        }

        state.connected.store(false, Ordering::SeqCst);
        state.request_table.fail_all(ClientError::ConnectionClosed).await;
        state.notify_error(ClientError::ConnectionClosed).await;

        if state.auto_reconnect.load(Ordering::SeqCst) && !state.closing.load(Ordering::SeqCst) {
            Self::reconnect_loop(state).await;
        }
    }

    async fn reconnect_loop(state: Arc<SessionState<C>>) {
        let Some(dialed) = state.dialed.lock().await.clone() else { return };

        let mut backoff = state.config.reconnect_initial_backoff_ms.max(1);
        loop {
            if state.closing.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(backoff)).await;
            match Self::dial(&dialed.addr, &dialed.target, state.config.connect_timeout_ms).await {
                Ok(conn) => {
                    tracing::info!(addr = %dialed.addr, "reconnected");
                    *state.conn.write().await = Some(conn.clone());
                    state.connected.store(true, Ordering::SeqCst);
                    state.touch_activity();

                    let session = ClientSession { state: state.clone() };
                    session.replay_subscriptions().await;
                    if state.auto_heartbeat.load(Ordering::SeqCst) {
                        session.maybe_spawn_heartbeat();
                    }

                    let loop_state = state.clone();
                    tokio::spawn(async move {
                        Self::receive_loop(loop_state, conn).await;
                    });
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff_ms = backoff, "reconnect attempt failed");
                    backoff = (backoff * 2).min(state.config.reconnect_max_backoff_ms.max(backoff));
                }
            }
        }
    }

    fn decode_response(body: &[u8], codec: &C) -> RawResult {
        if body.is_empty() {
            return RawResult::err(ClientError::Decode("empty response body".to_string()));
        }
        let status = body[0];
        let payload = &body[1..];
        if status == 0 {
            RawResult::ok(payload.to_vec())
        } else {
            match codec.unpack::<String>(payload) {
                Ok(msg) => RawResult::err(ClientError::ServerError(msg)),
                Err(e) => RawResult::err(ClientError::Decode(e.to_string())),
            }
        }
    }

    fn build_request_body<Args: Serialize>(&self, name: &str, args: &Args) -> Result<Vec<u8>> {
        let mut body = self
            .state
            .codec
            .pack(&name.to_string())
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        body.extend(self.state.codec.pack(args).map_err(|e| ClientError::Decode(e.to_string()))?);
        Ok(body)
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let conn = self.state.conn.read().await.clone().ok_or(ClientError::NotConnected)?;
        conn.send_frame(frame).await.map_err(ClientError::from)
    }

    async fn issue(&self, name: &str, args: impl Serialize, sink: WaiterSink) -> Result<u64> {
        let req_id = self.state.request_table.next_id();
        let body = self.build_request_body(name, &args)?;
        self.state.request_table.insert(req_id, Waiter { sink }).await;
        let frame = Frame::new(ReqKind::RpcRequest, req_id, body);
        if let Err(e) = self.send_frame(&frame).await {
            if let Some(waiter) = self.state.request_table.remove(req_id).await {
                waiter.sink.resolve(RawResult::err(e.clone()));
            }
            return Err(e);
        }
        Ok(req_id)
    }

    /// Synchronous call: blocks until a response arrives or
    /// `config.default_timeout_ms` elapses.
    pub async fn call<Ret: DeserializeOwned>(&self, name: &str, args: impl Serialize) -> Result<Ret> {
        self.call_with_timeout(name, args, self.state.config.default_timeout_ms).await
    }

    /// Synchronous call with an explicit timeout override; 0 means no
    /// timeout.
    pub async fn call_with_timeout<Ret: DeserializeOwned>(
        &self,
        name: &str,
        args: impl Serialize,
        timeout_ms: u64,
    ) -> Result<Ret> {
        let (tx, rx) = oneshot::channel();
        let req_id = self.issue(name, args, WaiterSink::Future(tx)).await?;

        let raw = if timeout_ms == 0 {
            rx.await.map_err(|_| ClientError::ConnectionClosed)?
        } else {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
                Ok(received) => received.map_err(|_| ClientError::ConnectionClosed)?,
                Err(_) => {
                    self.state.request_table.remove(req_id).await;
                    return Err(ClientError::Timeout);
                }
            }
        };
        raw.decode(&self.state.codec)
    }

    /// Future-shaped call: issues the request and returns immediately with
    /// a handle the caller awaits independently. `timeout_ms` of 0 means
    /// no timeout.
    pub async fn async_call_future(&self, name: &str, args: impl Serialize, timeout_ms: u64) -> Result<CallFuture> {
        let (tx, rx) = oneshot::channel();
        let req_id = self.issue(name, args, WaiterSink::Future(tx)).await?;
        if timeout_ms > 0 {
            self.spawn_timeout_supervisor(req_id, timeout_ms);
        }
        Ok(CallFuture(rx))
    }

    /// Callback-shaped call: issues the request and returns once it's been
    /// written; `cb` runs exactly once when the result is known (success,
    /// timeout, or connection error). `timeout_ms` of 0 means no timeout.
    pub async fn async_call_cb(
        &self,
        name: &str,
        args: impl Serialize,
        timeout_ms: u64,
        cb: impl FnOnce(RawResult) + Send + 'static,
    ) -> Result<()> {
        let req_id = self.issue(name, args, WaiterSink::Callback(Box::new(cb))).await?;
        if timeout_ms > 0 {
            self.spawn_timeout_supervisor(req_id, timeout_ms);
        }
        Ok(())
    }

    fn spawn_timeout_supervisor(&self, req_id: u64, timeout_ms: u64) {
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            if let Some(waiter) = state.request_table.remove(req_id).await {
                waiter.sink.resolve(RawResult::err(ClientError::Timeout));
            }
        });
    }

    /// Subscribes to `key` with no token.
    pub async fn subscribe(&self, key: impl Into<String>, cb: SubscribeCallback) -> Result<()> {
        self.subscribe_inner(key.into(), None, cb).await
    }

    /// Subscribes to `key`, receiving only publications qualified with
    /// `token`. An empty-string token is a synonym for no token.
    pub async fn subscribe_with_token(
        &self,
        key: impl Into<String>,
        token: impl Into<String>,
        cb: SubscribeCallback,
    ) -> Result<()> {
        self.subscribe_inner(key.into(), Some(token.into()), cb).await
    }

    async fn subscribe_inner(&self, key: String, token: Option<String>, cb: SubscribeCallback) -> Result<()> {
        self.state.subscribe_table.insert(key.clone(), token.clone(), cb).await;
        if self.has_connected() {
            let body = self
                .state
                .codec
                .pack(&(key, token.unwrap_or_default()))
                .map_err(|e| ClientError::Decode(e.to_string()))?;
            let frame = Frame::new(ReqKind::SubscribeRequest, 0, body);
            self.send_frame(&frame).await?;
        }
        Ok(())
    }

    /// Closes the session: fails every outstanding waiter with
    /// `ConnectionClosed`, stops reconnect, and closes the socket.
    pub async fn close(&self) {
        self.state.closing.store(true, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        self.state.request_table.fail_all(ClientError::ConnectionClosed).await;
        if let Some(conn) = self.state.conn.write().await.take() {
            conn.close().await;
        }
    }
}
