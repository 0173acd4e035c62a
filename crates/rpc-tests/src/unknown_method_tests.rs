//! Calling a method the server never registered is a typed error, not a
//! dropped connection.

use crate::harness::{connect_client, new_test_server, start_server};

#[tokio::test]
async fn an_unregistered_method_name_errors_without_closing_the_connection() {
    let server = new_test_server();
    server
        .register_handler("echo", |_ctx, args: String| async move { Ok::<String, String>(args) })
        .await
        .unwrap();
    let addr = start_server(server).await;
    let client = connect_client(&addr).await;

    let err = client.call::<()>("does_not_exist", ()).await.unwrap_err();
    assert!(matches!(err, rpc_client::ClientError::ServerError(_)));

    let reply: String = client.call("echo", "after the miss".to_string()).await.unwrap();
    assert_eq!(reply, "after the miss");

    client.close().await;
}
