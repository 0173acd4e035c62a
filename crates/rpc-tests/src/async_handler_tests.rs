//! Deferred responses: an async handler returns immediately to the
//! dispatcher and answers later via `ConnectionContext::pack_and_response`.

use std::time::Duration;

use crate::harness::{connect_client, new_test_server, start_server};

#[tokio::test]
async fn an_async_handler_answers_after_its_own_background_work_completes() {
    let server = new_test_server();
    server
        .register_handler_async("delayed_echo", |ctx, args: String| async move {
            let req_id = ctx.request_id();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                ctx.pack_and_response(req_id, args).await;
            });
        })
        .await
        .unwrap();
    let addr = start_server(server).await;
    let client = connect_client(&addr).await;

    // Generous timeout: the dispatcher itself returns instantly for this
    // handler, so the only latency is the background task's own sleep.
    let reply: String = client.call_with_timeout("delayed_echo", "later".to_string(), 2_000).await.unwrap();
    assert_eq!(reply, "later");

    client.close().await;
}

#[tokio::test]
async fn a_decode_failure_against_an_async_handler_errors_immediately_instead_of_hanging() {
    let server = new_test_server();
    server
        .register_handler_async("needs_pair", |_ctx, _args: (i32, i32)| async move {})
        .await
        .unwrap();
    let addr = start_server(server).await;
    let client = connect_client(&addr).await;

    // The handler body never runs (the args don't decode as a pair), so
    // nothing will ever call pack_and_response; a short timeout here would
    // mask the bug this guards against, so generous headroom around an
    // expected-fast error is what actually exercises it.
    let err = client
        .call_with_timeout::<()>("needs_pair", "not a pair".to_string(), 2_000)
        .await
        .unwrap_err();
    assert!(matches!(err, rpc_client::ClientError::ServerError(_)));

    client.close().await;
}
