//! Per-request handle to the connection a request arrived on.
//!
//! Holds only a **weak** reference to the connection: an async handler may
//! run long after the read-loop iteration that decoded its request, and
//! upgrading that weak reference is the only way the deferred response
//! path can tell whether the connection is still alive. If upgrading
//! fails, the response is dropped — that is the intended cancellation path
//! for async handlers, not a bug to route around.

use std::sync::{Arc, Weak};

use rpc_transport::{Codec, Frame, ReqKind};
use serde::Serialize;

use crate::connection::ConnectionHandle;

/// Carries the originating connection (weakly) and the request id a
/// deferred response must be sent against.
pub struct ConnectionContext<C: Codec> {
    connection: Weak<ConnectionHandle>,
    request_id: u64,
    codec: Arc<C>,
}

impl<C: Codec> Clone for ConnectionContext<C> {
    fn clone(&self) -> Self {
        Self { connection: self.connection.clone(), request_id: self.request_id, codec: self.codec.clone() }
    }
}

impl<C: Codec> ConnectionContext<C> {
    pub(crate) fn new(connection: Weak<ConnectionHandle>, request_id: u64, codec: Arc<C>) -> Self {
        Self { connection, request_id, codec }
    }

    /// The request id this context was created for. An async handler must
    /// copy this out before it returns, since the context itself may be
    /// dropped once the handler yields control.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Sends a deferred success response for `req_id`, packed from `value`.
    /// Silently does nothing if the originating connection has since
    /// closed — there is no error to report to, and nothing to retry.
    pub async fn pack_and_response<T: Serialize>(&self, req_id: u64, value: T) {
        let Some(conn) = self.connection.upgrade() else {
            tracing::debug!(req_id, "dropping deferred response, connection is gone");
            return;
        };
        let Ok(payload) = self.codec.pack(&value) else {
            tracing::warn!(req_id, "failed to encode deferred response payload");
            return;
        };
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(0u8);
        body.extend(payload);
        let frame = Frame::new(ReqKind::RpcResponse, req_id, body);
        conn.enqueue_response(frame).await;
    }
}
