//! A single accepted connection's write side.
//!
//! Reads happen directly against the underlying [`Connection`] from the
//! connection's own task; writes go through a bounded queue so a slow or
//! stuck peer can't let one connection's handler responses pile up
//! unboundedly, and so the dispatcher and the broker share one writer
//! discipline instead of racing independent `send_frame` calls.

use std::sync::Arc;

use rpc_transport::{Connection, Frame, Result as TransportResult};
use tokio::sync::mpsc;

/// Bound on a connection's outbound frame queue. Sized generously since
/// draining is just one `send_frame` per item; the bound exists to cap
/// memory on a stalled peer, not to throttle a healthy one.
const WRITE_QUEUE_CAPACITY: usize = 256;

/// A connection plus its outbound write queue.
///
/// Held by the read loop (strong) and handed out as a [`std::sync::Weak`]
/// to async handlers and broker subscriptions, so neither can keep a
/// closed connection alive.
pub struct ConnectionHandle {
    conn: Arc<dyn Connection>,
    tx: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    /// Wraps `conn`, spawning the writer task that drains its queue.
    pub fn spawn(conn: Arc<dyn Connection>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Frame>(WRITE_QUEUE_CAPACITY);
        let writer_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer_conn.send_frame(&frame).await {
                    tracing::debug!(error = %e, "connection write failed, stopping writer");
                    break;
                }
            }
        });
        Arc::new(Self { conn, tx })
    }

    /// Enqueues an RPC response frame, awaiting queue capacity if full.
    /// This is the back-pressure path: correctness over throughput, so a
    /// dispatcher worker blocks rather than dropping a caller's response.
    pub async fn enqueue_response(&self, frame: Frame) {
        if self.tx.send(frame).await.is_err() {
            tracing::debug!("connection closed before response could be enqueued");
        }
    }

    /// Attempts to enqueue a publication without blocking. Best-effort: a
    /// full queue or a closed connection silently drops the publication to
    /// this one recipient, per the broker's delivery contract.
    pub fn try_publish(&self, frame: Frame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Reads the next frame directly from the underlying connection. Only
    /// the connection's own read-loop task may call this; unlike writes,
    /// reads are not serialized through the handle because there is only
    /// ever one reader.
    pub async fn recv_frame(&self) -> TransportResult<Frame> {
        self.conn.recv_frame().await
    }

    /// The peer address, for logging.
    pub fn peer_addr(&self) -> &str {
        self.conn.peer_addr()
    }

    /// Closes the underlying connection.
    pub async fn close(&self) {
        self.conn.close().await;
    }
}
