//! Token-qualified pub/sub fan-out: `publish` reaches every subscriber of a
//! key regardless of token, `publish_by_token` reaches only the matching one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::harness::{connect_client, new_test_server, start_server};

#[tokio::test]
async fn publish_reaches_everyone_and_publish_by_token_reaches_only_the_match() {
    let server = new_test_server();
    let addr = start_server(server.clone()).await;

    let a = connect_client(&addr).await;
    let b = connect_client(&addr).await;
    let c = connect_client(&addr).await;

    let a_hits = Arc::new(AtomicUsize::new(0));
    let b_hits = Arc::new(AtomicUsize::new(0));
    let c_hits = Arc::new(AtomicUsize::new(0));

    let h = a_hits.clone();
    a.subscribe("topic", Arc::new(move |_| { h.fetch_add(1, Ordering::SeqCst); })).await.unwrap();
    let h = b_hits.clone();
    b.subscribe_with_token("topic", "T1", Arc::new(move |_| { h.fetch_add(1, Ordering::SeqCst); })).await.unwrap();
    let h = c_hits.clone();
    c.subscribe_with_token("topic", "T2", Arc::new(move |_| { h.fetch_add(1, Ordering::SeqCst); })).await.unwrap();

    // Subscriptions land asynchronously on the broker; give them a moment
    // before the first publication.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let delivered = server.publish("topic", b"first".to_vec()).await;
    assert_eq!(delivered, 3);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a_hits.load(Ordering::SeqCst), 1);
    assert_eq!(b_hits.load(Ordering::SeqCst), 1);
    assert_eq!(c_hits.load(Ordering::SeqCst), 1);

    let delivered = server.publish_by_token("topic", "T1", b"second".to_vec()).await;
    assert_eq!(delivered, 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a_hits.load(Ordering::SeqCst), 1);
    assert_eq!(b_hits.load(Ordering::SeqCst), 2);
    assert_eq!(c_hits.load(Ordering::SeqCst), 1);

    let mut tokens = server.get_token_list().await;
    tokens.sort();
    assert_eq!(tokens, vec!["T1".to_string(), "T2".to_string()]);

    a.close().await;
    b.close().await;
    c.close().await;
}

#[tokio::test]
async fn one_session_with_two_registrations_on_a_key_only_fires_the_matching_one() {
    let server = new_test_server();
    let addr = start_server(server.clone()).await;

    let client = connect_client(&addr).await;

    let none_hits = Arc::new(AtomicUsize::new(0));
    let t1_hits = Arc::new(AtomicUsize::new(0));

    let h = none_hits.clone();
    client.subscribe("topic", Arc::new(move |_| { h.fetch_add(1, Ordering::SeqCst); })).await.unwrap();
    let h = t1_hits.clone();
    client.subscribe_with_token("topic", "T1", Arc::new(move |_| { h.fetch_add(1, Ordering::SeqCst); })).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    // A single connection now holds two registrations on "topic": one with
    // no token, one with "T1". A token-qualified publish must still only
    // wake the matching registration, not every callback the broker routed
    // to this connection.
    server.publish_by_token("topic", "T1", b"only-t1".to_vec()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(none_hits.load(Ordering::SeqCst), 0);
    assert_eq!(t1_hits.load(Ordering::SeqCst), 1);

    client.close().await;
}
