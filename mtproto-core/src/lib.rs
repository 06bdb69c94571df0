//! # mtproto-core
//!
//! Core library for the MTProto v1 client protocol.
//!
//! This crate provides the TL wire codec, the AES-IGE cipher, the
//! Diffie-Hellman key exchange that produces an authorization key, and the
//! message framer that encrypts and sequences traffic once a key exists.
//! It performs no I/O; see `mtproto-client` for the session loop.

pub mod auth;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod framer;
pub mod handshake;
pub mod ige;
pub mod msgid;
pub mod pq;
pub mod rsa;
pub mod schema;
pub mod state;
pub mod tl;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use auth::{AuthKey, AuthResult};
pub use error::{DecodeError, MtprotoError, MtprotoResult};
pub use framer::{Framer, FramerState, Msg, MsgKind};
pub use handshake::{ExchangeState, KeyExchange};
pub use msgid::MessageIdGenerator;
pub use rsa::RsaPublicKey;
pub use schema::ServiceMessage;
pub use state::{DcOption, PersistedState};
pub use tl::{Deserializable, Identifiable, Reader, Serializable, TlFamily, Writer};

/// Protocol layer this crate speaks.
pub const PROTOCOL_VERSION: &str = "1.0";
