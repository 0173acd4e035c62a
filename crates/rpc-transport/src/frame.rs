//! Fixed-header, variable-body wire frame.
//!
//! Header layout (13 bytes, little-endian): `body_len: u32`, `req_type: u8`,
//! `req_id: u64`. This is the only framing the wire protocol has — no magic
//! number, no checksum, no version byte. Endianness and layout are fixed by
//! the protocol and must not be changed without breaking every existing peer.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 13;

/// Upper bound on a single frame's body, guarding against a corrupt
/// `body_len` causing an unbounded allocation.
pub const MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Wire-stable request-type tag. Values are fixed by the protocol; a byte
/// value of 3 is intentionally unassigned (reserved by the reference
/// implementation for an unsubscribe variant that was never wired up) and
/// must not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReqKind {
    /// Client-to-server method invocation.
    RpcRequest = 0,
    /// Server-to-client method result.
    RpcResponse = 1,
    /// Empty fire-and-forget keepalive.
    Heartbeat = 2,
    /// Client-to-server topic (and optional token) subscription.
    SubscribeRequest = 4,
    /// Server-to-client (or broker-originated) topic publication.
    PublishRequest = 5,
}

impl ReqKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(ReqKind::RpcRequest),
            1 => Some(ReqKind::RpcResponse),
            2 => Some(ReqKind::Heartbeat),
            4 => Some(ReqKind::SubscribeRequest),
            5 => Some(ReqKind::PublishRequest),
            _ => None,
        }
    }
}

/// A single length-framed message.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Correlation id: echoed by a response, chosen by the sender for a
    /// request, ignored (set to 0) for heartbeats.
    pub req_id: u64,
    /// Wire tag for the body's shape.
    pub req_type: ReqKind,
    /// Codec-packed body; interpretation depends on `req_type` (see module
    /// docs on `rpc_transport::codec`).
    pub body: Vec<u8>,
}

impl Frame {
    /// Build a new frame.
    pub fn new(req_type: ReqKind, req_id: u64, body: Vec<u8>) -> Self {
        Self { req_id, req_type, body }
    }

    /// Build the 13-byte header + body for this frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.len());
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.push(self.req_type as u8);
        out.extend_from_slice(&self.req_id.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Write this frame to an async writer. A single logical write call so
    /// that two frames enqueued back-to-back on a writer never interleave
    /// at the OS level, matching the single-writer discipline required on
    /// every connection.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read exactly one frame from an async reader: the header first, then
    /// exactly `body_len` bytes. Any short read is fatal for the connection.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let body_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let req_type_byte = header[4];
        let req_id = u64::from_le_bytes([
            header[5], header[6], header[7], header[8], header[9], header[10], header[11],
            header[12],
        ]);

        if body_len > MAX_BODY_SIZE {
            return Err(TransportError::ProtocolError {
                reason: format!("body_len {} exceeds max frame size {}", body_len, MAX_BODY_SIZE),
            });
        }
        let req_type = ReqKind::from_u8(req_type_byte).ok_or_else(|| TransportError::ProtocolError {
            reason: format!("unknown req_type byte {}", req_type_byte),
        })?;

        let mut body = vec![0u8; body_len as usize];
        if !body.is_empty() {
            reader.read_exact(&mut body).await?;
        }

        Ok(Frame { req_id, req_type, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_through_a_pipe() {
        let frame = Frame::new(ReqKind::RpcRequest, 7, b"hello".to_vec());
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_SIZE + 5);

        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = Frame::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded.req_id, 7);
        assert_eq!(decoded.req_type, ReqKind::RpcRequest);
        assert_eq!(decoded.body, b"hello");
    }

    #[tokio::test]
    async fn rejects_unknown_req_type() {
        let mut header = [0u8; HEADER_SIZE];
        header[4] = 9; // unassigned tag
        let mut cursor = std::io::Cursor::new(header.to_vec());
        let err = Frame::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, TransportError::ProtocolError { .. }));
    }

    #[tokio::test]
    async fn rejects_oversized_body_len() {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&(MAX_BODY_SIZE + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(header.to_vec());
        let err = Frame::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, TransportError::ProtocolError { .. }));
    }
}
