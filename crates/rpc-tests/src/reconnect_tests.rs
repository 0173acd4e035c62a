//! Auto-reconnect: a session with `enable_auto_reconnect()` redials after
//! the connection drops and replays its subscriptions without the caller
//! re-issuing them.
//!
//! Exercised against a hand-rolled peer (not the full `Server`) so the test
//! controls exactly when the connection is severed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rpc_client::{ClientConfig, ClientSession};
use rpc_transport::{Connection, Listener, ReqKind, TcpTransport, TcpTransportConfig, Transport};

#[tokio::test]
async fn a_subscription_is_replayed_after_a_forced_reconnect() {
    let transport = TcpTransport::new(TcpTransportConfig::default());
    let listener = transport.listen("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let subscribes_seen = Arc::new(AtomicUsize::new(0));

    // First incarnation of the peer: accept one connection, observe the
    // initial subscribe frame, then half-close to simulate a mid-session
    // drop.
    let seen = subscribes_seen.clone();
    let first = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let frame = conn.recv_frame().await.unwrap();
        assert_eq!(frame.req_type, ReqKind::SubscribeRequest);
        seen.fetch_add(1, Ordering::SeqCst);
        conn.close().await;
        listener
    });

    let (host, port) = addr.rsplit_once(':').unwrap();
    let client = ClientSession::new(ClientConfig {
        reconnect_initial_backoff_ms: 20,
        reconnect_max_backoff_ms: 100,
        ..ClientConfig::default()
    });
    client.enable_auto_reconnect();
    client.connect(host, port.parse().unwrap(), false, Duration::from_secs(2)).await.unwrap();
    client.subscribe("topic", Arc::new(|_| {})).await.unwrap();

    let listener = first.await.unwrap();

    // Second incarnation: accept the reconnect and observe the subscribe
    // being replayed without any call from this test.
    let seen = subscribes_seen.clone();
    let second = tokio::spawn(async move {
        let conn = listener.accept().await.unwrap();
        let frame = conn.recv_frame().await.unwrap();
        assert_eq!(frame.req_type, ReqKind::SubscribeRequest);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    tokio::time::timeout(Duration::from_secs(2), second).await.unwrap().unwrap();
    assert_eq!(subscribes_seen.load(Ordering::SeqCst), 2);

    client.close().await;
}
