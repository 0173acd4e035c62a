//! Shared plumbing for spinning up a loopback server/client pair.

use std::sync::Arc;
use std::time::Duration;

use rpc_client::{ClientConfig, ClientSession};
use rpc_server::{Server, ServerConfig};

/// A server bound to an ephemeral loopback port, with a small worker pool
/// sized for one test rather than `available_parallelism()`.
pub fn new_test_server() -> Arc<Server> {
    let config = ServerConfig { host: "127.0.0.1".to_string(), ..ServerConfig::new(0, 4, None) };
    Arc::new(Server::with_config(config))
}

/// Starts `server`'s accept loop in the background and returns its bound
/// `host:port` address.
pub async fn start_server(server: Arc<Server>) -> String {
    let (addr, _task) = server.serve().await.expect("server failed to bind");
    addr
}

/// Connects a fresh client session to `addr` over plain TCP.
pub async fn connect_client(addr: &str) -> ClientSession {
    let (host, port) = addr.rsplit_once(':').expect("addr must be host:port");
    let client = ClientSession::new(ClientConfig::default());
    client
        .connect(host, port.parse().expect("port must be numeric"), false, Duration::from_secs(2))
        .await
        .expect("client failed to connect");
    client
}
