//! A call that outlives its deadline returns a typed timeout, and the late
//! response that eventually arrives is discarded rather than resolving a
//! waiter a second time.

use std::time::Duration;

use crate::harness::{connect_client, new_test_server, start_server};

#[tokio::test]
async fn a_slow_handler_produces_a_timeout_and_the_session_stays_usable() {
    let server = new_test_server();
    server
        .register_handler("slow", |_ctx, _args: ()| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<(), String>(())
        })
        .await
        .unwrap();
    server
        .register_handler("echo", |_ctx, args: String| async move { Ok::<String, String>(args) })
        .await
        .unwrap();
    let addr = start_server(server).await;
    let client = connect_client(&addr).await;

    let err = client.call_with_timeout::<()>("slow", (), 30).await.unwrap_err();
    assert!(matches!(err, rpc_client::ClientError::Timeout));

    // The handler is still running server-side and will eventually write a
    // response for the id the client has already forgotten; give it time to
    // land, then confirm ordinary traffic still flows.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let reply: String = client.call("echo", "still here".to_string()).await.unwrap();
    assert_eq!(reply, "still here");

    client.close().await;
}
