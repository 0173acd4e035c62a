//! Round-trip a single synchronous call end to end.

use crate::harness::{connect_client, new_test_server, start_server};

#[tokio::test]
async fn echo_round_trip_returns_the_same_payload() {
    let server = new_test_server();
    server
        .register_handler("echo", |_ctx, args: String| async move { Ok::<String, String>(args) })
        .await
        .unwrap();
    let addr = start_server(server).await;

    let client = connect_client(&addr).await;
    let reply: String = client.call("echo", "hello".to_string()).await.unwrap();
    assert_eq!(reply, "hello");

    client.close().await;
}

#[tokio::test]
async fn a_handler_error_becomes_a_typed_server_error_without_closing_the_connection() {
    let server = new_test_server();
    server
        .register_handler("reject", |_ctx, _args: ()| async move { Err::<(), String>("nope".to_string()) })
        .await
        .unwrap();
    server
        .register_handler("echo", |_ctx, args: String| async move { Ok::<String, String>(args) })
        .await
        .unwrap();
    let addr = start_server(server).await;
    let client = connect_client(&addr).await;

    let err = client.call::<()>("reject", ()).await.unwrap_err();
    assert!(matches!(err, rpc_client::ClientError::ServerError(msg) if msg == "nope"));

    let reply: String = client.call("echo", "still alive".to_string()).await.unwrap();
    assert_eq!(reply, "still alive");

    client.close().await;
}
