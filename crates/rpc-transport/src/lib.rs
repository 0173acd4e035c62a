#![warn(missing_docs)]
//! Wire framing, the codec boundary, and TCP/TLS transports for the RPC
//! framework. This crate knows nothing about method dispatch, call shapes,
//! or pub/sub — it only gets bytes reliably from one peer to another.

pub mod codec;
pub mod error;
pub mod frame;
pub mod tcp;
pub mod tls;
pub mod transport;

pub use codec::{BincodeCodec, Codec};
pub use error::{Result, TransportError};
pub use frame::{Frame, ReqKind, HEADER_SIZE, MAX_BODY_SIZE};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use tls::{generate_self_signed_pair, TlsConfig, TlsTransport};
pub use transport::{Connection, Listener, Transport};
