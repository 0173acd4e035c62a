//! Serialization boundary between user values and wire bytes.
//!
//! Arguments and return values never touch the framing layer directly — they
//! cross through a `Codec`. This keeps `Frame` ignorant of any particular
//! serialization format, matching the external-collaborator boundary in the
//! project's scope: the codec itself is swappable, only its `pack`/`unpack`
//! contract is load-bearing.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TransportError};

/// Packs and unpacks user values to and from bytes for wire transmission.
pub trait Codec: Send + Sync + 'static {
    /// Serialize a value to bytes.
    fn pack<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes into a value.
    fn unpack<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Deserialize a value from the front of `bytes`, returning the value and
    /// the number of bytes consumed. Used to read a method name followed
    /// immediately by a packed argument tuple out of the same request body
    /// without a length prefix between them.
    fn unpack_prefix<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<(T, usize)>;
}

/// Default codec: [`bincode`], a compact binary serialization format well
/// suited to RPC payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn pack<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| TransportError::Codec(e.to_string()))
    }

    fn unpack<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| TransportError::Codec(e.to_string()))
    }

    fn unpack_prefix<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<(T, usize)> {
        let mut cursor = std::io::Cursor::new(bytes);
        let value = bincode::deserialize_from(&mut cursor)
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        Ok((value, cursor.position() as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_a_value() {
        let codec = BincodeCodec;
        let bytes = codec.pack(&("echo".to_string(), 42u32)).unwrap();
        let (name, len): (String, usize) = codec.unpack_prefix(&bytes).unwrap();
        assert_eq!(name, "echo");
        let rest: u32 = codec.unpack(&bytes[len..]).unwrap();
        assert_eq!(rest, 42);
    }
}
