//! Topic/token pub-sub fan-out.
//!
//! Subscriber handles are held weakly and pruned opportunistically during
//! publish rather than eagerly on disconnect, per the design notes' simpler
//! of the two acceptable strategies. Delivery itself is non-blocking per
//! recipient: a full write queue or a closed connection just drops that
//! one recipient's copy, per the broker's best-effort delivery contract.

use std::collections::{HashMap, HashSet};
use std::sync::Weak;

use rpc_transport::{Codec, Frame, ReqKind};
use tokio::sync::Mutex;

use crate::connection::ConnectionHandle;

struct Subscriber {
    connection: Weak<ConnectionHandle>,
    token: Option<String>,
}

/// A snapshot of broker occupancy, for health/readiness logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerStats {
    /// Number of distinct topics with at least one subscriber.
    pub topic_count: usize,
    /// Total subscriber entries across all topics.
    pub subscriber_count: usize,
    /// Number of distinct tokens in use.
    pub known_token_count: usize,
}

/// Topic table (`key` → subscribers) plus the flat set of known tokens.
/// Survives independently of any one connection.
pub struct Broker {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl Broker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self { topics: Mutex::new(HashMap::new()) }
    }

    /// Registers `connection` as a subscriber of `key`, optionally
    /// qualified by `token`. An empty-string token is a synonym for no
    /// token.
    pub async fn subscribe(&self, key: String, token: Option<String>, connection: Weak<ConnectionHandle>) {
        let token = token.filter(|t| !t.is_empty());
        self.topics.lock().await.entry(key).or_default().push(Subscriber { connection, token });
    }

    /// Removes every subscriber entry backed by `connection`, across every
    /// topic. Called once a connection's read loop ends.
    pub async fn purge(&self, connection: &Weak<ConnectionHandle>) {
        let mut topics = self.topics.lock().await;
        for subs in topics.values_mut() {
            subs.retain(|s| !Weak::ptr_eq(&s.connection, connection));
        }
    }

    /// Delivers `payload` under `key` to every subscriber regardless of token.
    /// Returns the number of subscribers the payload was actually enqueued
    /// for (a full queue or a dead connection does not count).
    pub async fn publish<C: Codec>(&self, codec: &C, key: &str, payload: Vec<u8>) -> usize {
        self.fan_out(codec, key, None, payload).await
    }

    /// Delivers `payload` under `key` only to subscribers whose token
    /// equals `token`; subscribers without a token never match.
    pub async fn publish_by_token<C: Codec>(&self, codec: &C, key: &str, token: &str, payload: Vec<u8>) -> usize {
        self.fan_out(codec, key, Some(token), payload).await
    }

    async fn fan_out<C: Codec>(&self, codec: &C, key: &str, token_filter: Option<&str>, payload: Vec<u8>) -> usize {
        let targets = {
            let mut topics = self.topics.lock().await;
            let Some(subs) = topics.get_mut(key) else { return 0 };
            subs.retain(|s| s.connection.strong_count() > 0);
            subs.iter()
                .filter(|s| match token_filter {
                    None => true,
                    Some(t) => s.token.as_deref() == Some(t),
                })
                .filter_map(|s| s.connection.upgrade())
                .collect::<Vec<_>>()
        };

        let Some(body) = codec.pack(&(key.to_string(), token_filter.unwrap_or("").to_string(), payload)).ok() else {
            tracing::warn!(key, "failed to encode publish payload");
            return 0;
        };

        let mut delivered = 0;
        for conn in targets {
            let frame = Frame::new(ReqKind::PublishRequest, 0, body.clone());
            if conn.try_publish(frame) {
                delivered += 1;
            } else {
                tracing::debug!(key, peer = conn.peer_addr(), "dropped publication, queue full or closed");
            }
        }
        delivered
    }

    /// Every distinct token currently in use, across all topics. Iteration
    /// order is unspecified.
    pub async fn get_token_list(&self) -> Vec<String> {
        let topics = self.topics.lock().await;
        let mut tokens = HashSet::new();
        for subs in topics.values() {
            for s in subs {
                if let Some(t) = &s.token {
                    tokens.insert(t.clone());
                }
            }
        }
        tokens.into_iter().collect()
    }

    /// Snapshot of current occupancy.
    pub async fn stats(&self) -> BrokerStats {
        let topics = self.topics.lock().await;
        let subscriber_count = topics.values().map(|v| v.len()).sum();
        let known_token_count = {
            let mut tokens = HashSet::new();
            for subs in topics.values() {
                for s in subs {
                    if let Some(t) = &s.token {
                        tokens.insert(t.clone());
                    }
                }
            }
            tokens.len()
        };
        BrokerStats { topic_count: topics.len(), subscriber_count, known_token_count }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_transport::BincodeCodec;
    use std::sync::Arc;

    struct FakeConn;

    #[async_trait::async_trait]
    impl rpc_transport::Connection for FakeConn {
        async fn send_frame(&self, _frame: &Frame) -> rpc_transport::Result<()> {
            Ok(())
        }
        async fn recv_frame(&self) -> rpc_transport::Result<Frame> {
            std::future::pending().await
        }
        fn peer_addr(&self) -> &str {
            "fake"
        }
        fn local_addr(&self) -> &str {
            "fake"
        }
        async fn close(&self) {}
    }

    fn fake_handle() -> std::sync::Arc<ConnectionHandle> {
        ConnectionHandle::spawn(Arc::new(FakeConn))
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_regardless_of_token() {
        let broker = Broker::new();
        let a = fake_handle();
        let b = fake_handle();
        let c = fake_handle();
        broker.subscribe("key".into(), None, Arc::downgrade(&a)).await;
        broker.subscribe("key".into(), Some("T1".into()), Arc::downgrade(&b)).await;
        broker.subscribe("key".into(), Some("T2".into()), Arc::downgrade(&c)).await;

        let delivered = broker.publish(&BincodeCodec, "key", b"X".to_vec()).await;
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn publish_by_token_reaches_only_the_matching_token() {
        let broker = Broker::new();
        let a = fake_handle();
        let b = fake_handle();
        let c = fake_handle();
        broker.subscribe("key".into(), None, Arc::downgrade(&a)).await;
        broker.subscribe("key".into(), Some("T1".into()), Arc::downgrade(&b)).await;
        broker.subscribe("key".into(), Some("T2".into()), Arc::downgrade(&c)).await;

        let delivered = broker.publish_by_token(&BincodeCodec, "key", "T1", b"Y".to_vec()).await;
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn dropped_connections_are_pruned_from_delivery() {
        let broker = Broker::new();
        let a = fake_handle();
        broker.subscribe("key".into(), None, Arc::downgrade(&a)).await;
        drop(a);

        let delivered = broker.publish(&BincodeCodec, "key", b"X".to_vec()).await;
        assert_eq!(delivered, 0);
        assert_eq!(broker.stats().await.subscriber_count, 0);
    }

    #[tokio::test]
    async fn get_token_list_enumerates_distinct_tokens() {
        let broker = Broker::new();
        let a = fake_handle();
        let b = fake_handle();
        broker.subscribe("key".into(), Some("T1".into()), Arc::downgrade(&a)).await;
        broker.subscribe("other".into(), Some("T1".into()), Arc::downgrade(&b)).await;

        let mut tokens = broker.get_token_list().await;
        tokens.sort();
        assert_eq!(tokens, vec!["T1".to_string()]);
    }
}
