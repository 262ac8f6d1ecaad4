//! TL binary serialization and the MTProto service schema.
//!
//! # Overview
//!
//! | Module          | Contents                                                   |
//! |-----------------|------------------------------------------------------------|
//! | [`serialize`]   | [`Serializable`] and primitive encoders                    |
//! | [`deserialize`] | [`Deserializable`], [`Cursor`] and primitive decoders      |
//! | [`mtproto`]     | Handshake and service-message constructors                 |
//! | [`schema`]      | Constructor ids of the application methods the engine inspects |
//!
//! Application methods are opaque to this crate: anything implementing
//! [`Serializable`] (and [`RemoteCall`] for typed results) can be sent.
//!
//! ```rust
//! use telecore_tl::{mtproto, Deserializable, Serializable};
//!
//! let ping = mtproto::Ping { ping_id: 42 };
//! let bytes = ping.to_bytes();
//! assert_eq!(mtproto::Ping::from_bytes(&bytes).unwrap(), ping);
//! ```

#![deny(unsafe_code)]

pub mod deserialize;
#[macro_use]
mod macros;
pub mod mtproto;
pub mod schema;
pub mod serialize;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// Constructor id of the boxed `Vector` type.
pub const VECTOR_ID: u32 = 0x1cb5c415;

/// Bare vector: `vector` (lowercase) as opposed to the boxed `Vector`.
///
/// Used where the schema sends a length-prefixed list without the
/// `0x1cb5c415` header, such as the body of `msg_container`.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);

/// Opaque bytes passed through without interpretation.
///
/// Serializes verbatim and deserializes by consuming the rest of the input,
/// which makes it the natural type for `X` results and `!X` queries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self { Self(v) }
}

// ─── Core traits ──────────────────────────────────────────────────────────────

/// Every schema type has a unique 32-bit constructor ID.
pub trait Identifiable {
    /// The constructor ID as specified in the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a function type that can be sent as an RPC call.
///
/// `Return` is the type the server responds with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}
