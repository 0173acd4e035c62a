//! Outstanding-request bookkeeping: request id allocation and the
//! id → waiter map.
//!
//! A background receive loop removes an entry and delivers to it; a timeout
//! path independently races to remove the same entry. `HashMap::remove`
//! under the shared mutex is the compare-and-swap this requires — whichever
//! side removes the entry first is the one that gets to resolve it, and the
//! loser finds nothing there.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{oneshot, Mutex};

use crate::call::RawResult;
use crate::error::ClientError;

/// How a pending call's result reaches its caller.
pub enum WaiterSink {
    /// A sync or future-shaped call: deliver through a oneshot channel.
    Future(oneshot::Sender<RawResult>),
    /// A callback-shaped call: invoke the closure exactly once.
    Callback(Box<dyn FnOnce(RawResult) + Send>),
}

impl WaiterSink {
    /// Consume the sink and deliver `result`. A dropped receiver (future
    /// side abandoned) is not an error here — there is nothing further to
    /// do with the result.
    pub fn resolve(self, result: RawResult) {
        match self {
            WaiterSink::Future(tx) => {
                let _ = tx.send(result);
            }
            WaiterSink::Callback(cb) => cb(result),
        }
    }
}

/// A single outstanding request awaiting a response.
pub struct Waiter {
    /// How to deliver the eventual result.
    pub sink: WaiterSink,
}

/// Maps outstanding `req_id` to its waiter, plus the monotonic id counter
/// used to allocate new request ids.
pub struct RequestTable {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl RequestTable {
    /// Creates an empty table whose first allocated id is 1 (0 is reserved
    /// for frame types that ignore `req_id`, e.g. `Heartbeat`).
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), waiters: Mutex::new(HashMap::new()) }
    }

    /// Allocates the next request id. Unique and monotonically increasing
    /// within this table's lifetime.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a waiter for `req_id`. Callers must insert before the
    /// request frame is written, so a response racing the write can never
    /// arrive before its waiter exists.
    pub async fn insert(&self, req_id: u64, waiter: Waiter) {
        self.waiters.lock().await.insert(req_id, waiter);
    }

    /// Removes and returns the waiter for `req_id`, if still present. The
    /// first caller to successfully remove an entry is the one allowed to
    /// resolve it; a second caller (response vs. timeout racing) finds
    /// nothing and must treat it as a no-op.
    pub async fn remove(&self, req_id: u64) -> Option<Waiter> {
        self.waiters.lock().await.remove(&req_id)
    }

    /// Removes every outstanding waiter and resolves each with `err`. Used
    /// by `close()` and by connection-loss handling so no waiter leaks.
    pub async fn fail_all(&self, err: ClientError) {
        let drained: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().await;
            waiters.drain().map(|(_, w)| w).collect()
        };
        for waiter in drained {
            waiter.sink.resolve(RawResult::err(err.clone()));
        }
    }

    /// Number of outstanding waiters, for diagnostics.
    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_the_matching_waiter_only() {
        let table = RequestTable::new();
        let (tx, rx) = oneshot::channel();
        let id = table.next_id();
        table.insert(id, Waiter { sink: WaiterSink::Future(tx) }).await;

        let other_id = table.next_id();
        assert!(table.remove(other_id).await.is_none());

        let waiter = table.remove(id).await.unwrap();
        waiter.sink.resolve(RawResult::ok(b"hi".to_vec()));
        let result = rx.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn a_removed_waiter_cannot_be_removed_twice() {
        let table = RequestTable::new();
        let (tx, _rx) = oneshot::channel();
        let id = table.next_id();
        table.insert(id, Waiter { sink: WaiterSink::Future(tx) }).await;

        assert!(table.remove(id).await.is_some());
        assert!(table.remove(id).await.is_none());
    }

    #[tokio::test]
    async fn fail_all_resolves_every_outstanding_waiter() {
        let table = RequestTable::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        table.insert(table.next_id(), Waiter { sink: WaiterSink::Future(tx1) }).await;
        table.insert(table.next_id(), Waiter { sink: WaiterSink::Future(tx2) }).await;

        table.fail_all(ClientError::ConnectionClosed).await;

        assert!(!rx1.await.unwrap().is_ok());
        assert!(!rx2.await.unwrap().is_ok());
        assert_eq!(table.len().await, 0);
    }
}
