//! Client-side record of active subscriptions, replayed on reconnect.
//!
//! The broker fans a publication out to a *connection* once that
//! connection holds any matching subscriber, but one session can register
//! several callbacks under the same key with different tokens (or none).
//! Dispatch still has to pick among them per the frame's own token: a plain
//! `publish` (empty frame token) reaches every entry under the key; a
//! `publish_by_token` frame reaches only the entries whose token equals it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// A publication callback. Invoked with the raw packed payload bytes.
pub type SubscribeCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

struct Entry {
    token: Option<String>,
    callback: SubscribeCallback,
}

/// Map of topic key to the (possibly several) registrations under it.
pub struct SubscribeTable {
    entries: Mutex<HashMap<String, Vec<Entry>>>,
}

impl SubscribeTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Registers `callback` for `key`, normalizing an empty-string token to
    /// "no token" per the framework's token/no-token synonym. A second
    /// registration for the same `(key, token)` replaces the first.
    pub async fn insert(&self, key: String, token: Option<String>, callback: SubscribeCallback) {
        let token = token.filter(|t| !t.is_empty());
        let mut entries = self.entries.lock().await;
        let bucket = entries.entry(key).or_default();
        if let Some(existing) = bucket.iter_mut().find(|e| e.token == token) {
            existing.callback = callback;
        } else {
            bucket.push(Entry { token, callback });
        }
    }

    /// Delivers `payload` to the callbacks registered under `key` whose
    /// token matches the publication's `frame_token`: `None` (a plain
    /// `publish`) matches every entry under `key`; `Some(t)` (a
    /// `publish_by_token`) matches only entries registered with that exact
    /// token, never the no-token entry. Releases the lock before invoking
    /// any callback.
    pub async fn dispatch(&self, key: &str, frame_token: Option<&str>, payload: Vec<u8>) -> usize {
        let callbacks: Vec<SubscribeCallback> = {
            let entries = self.entries.lock().await;
            match entries.get(key) {
                Some(bucket) => bucket
                    .iter()
                    .filter(|e| match frame_token {
                        None => true,
                        Some(t) => e.token.as_deref() == Some(t),
                    })
                    .map(|e| e.callback.clone())
                    .collect(),
                None => return 0,
            }
        };
        let count = callbacks.len();
        for callback in callbacks {
            callback(payload.clone());
        }
        count
    }

    /// Snapshots every `(key, token)` pair currently registered, for
    /// resubscription replay after a reconnect.
    pub async fn snapshot(&self) -> Vec<(String, Option<String>)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .flat_map(|(key, bucket)| bucket.iter().map(move |e| (key.clone(), e.token.clone())))
            .collect()
    }
}

impl Default for SubscribeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn a_plain_publish_dispatches_to_every_registration_on_a_key() {
        let table = SubscribeTable::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        table.insert("key".to_string(), None, Arc::new(move |_| { h1.fetch_add(1, Ordering::SeqCst); })).await;
        let h2 = hits.clone();
        table.insert("key".to_string(), Some("T1".to_string()), Arc::new(move |_| { h2.fetch_add(1, Ordering::SeqCst); })).await;

        let delivered = table.dispatch("key", None, b"X".to_vec()).await;
        assert_eq!(delivered, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_token_qualified_publish_dispatches_only_to_the_matching_token() {
        let table = SubscribeTable::new();
        let none_hits = Arc::new(AtomicUsize::new(0));
        let t1_hits = Arc::new(AtomicUsize::new(0));
        let t2_hits = Arc::new(AtomicUsize::new(0));

        let h = none_hits.clone();
        table.insert("key".to_string(), None, Arc::new(move |_| { h.fetch_add(1, Ordering::SeqCst); })).await;
        let h = t1_hits.clone();
        table.insert("key".to_string(), Some("T1".to_string()), Arc::new(move |_| { h.fetch_add(1, Ordering::SeqCst); })).await;
        let h = t2_hits.clone();
        table.insert("key".to_string(), Some("T2".to_string()), Arc::new(move |_| { h.fetch_add(1, Ordering::SeqCst); })).await;

        let delivered = table.dispatch("key", Some("T1"), b"Y".to_vec()).await;
        assert_eq!(delivered, 1);
        assert_eq!(none_hits.load(Ordering::SeqCst), 0);
        assert_eq!(t1_hits.load(Ordering::SeqCst), 1);
        assert_eq!(t2_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_token_is_a_synonym_for_no_token() {
        let table = SubscribeTable::new();
        table.insert("key".to_string(), Some(String::new()), Arc::new(|_| {})).await;
        table.insert("key".to_string(), None, Arc::new(|_| {})).await;
        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn second_registration_for_the_same_key_and_token_replaces_the_first() {
        let table = SubscribeTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        table.insert("key".to_string(), None, Arc::new(|_| {})).await;
        let h = hits.clone();
        table.insert("key".to_string(), None, Arc::new(move |_| { h.fetch_add(1, Ordering::SeqCst); })).await;

        table.dispatch("key", None, b"X".to_vec()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(table.snapshot().await.len(), 1);
    }
}
