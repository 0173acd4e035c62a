//! The untyped result of a call, and its typed decode helpers.

use rpc_transport::Codec;
use serde::de::DeserializeOwned;

use crate::error::{ClientError, Result};

/// The raw outcome of an RPC call: either the response payload's packed
/// bytes, or the error that prevented a payload from arriving. Callers
/// decode it to a concrete type with [`RawResult::decode`], or discard it
/// with [`RawResult::decode_unit`] for a void-typed reply.
#[derive(Debug, Clone)]
pub struct RawResult(std::result::Result<Vec<u8>, ClientError>);

impl RawResult {
    pub(crate) fn ok(bytes: Vec<u8>) -> Self {
        Self(Ok(bytes))
    }

    pub(crate) fn err(e: ClientError) -> Self {
        Self(Err(e))
    }

    /// True if the call succeeded at the transport/protocol level (a
    /// server-side handler error still counts as `Ok` here having already
    /// been translated to `Err` by the receive loop before construction).
    pub fn is_ok(&self) -> bool {
        self.0.is_ok()
    }

    /// Decode the payload as `T` using `codec`. Propagates any call error
    /// without attempting to decode.
    pub fn decode<T: DeserializeOwned, C: Codec>(self, codec: &C) -> Result<T> {
        let bytes = self.0?;
        codec.unpack(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Discard a void-typed reply, propagating any call error.
    pub fn decode_unit(self) -> Result<()> {
        self.0.map(|_| ())
    }
}
