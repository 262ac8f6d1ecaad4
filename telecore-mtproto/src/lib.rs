//! Sans-IO MTProto 2.0 building blocks.
//!
//! Nothing in this crate touches a socket. The async connection in
//! `telecore-client` drives these pieces:
//!
//! * [`transport`]: Abridged, Intermediate and Full framing
//! * [`plain`]: unencrypted frames used during key exchange
//! * [`authentication`] and [`dh_prime`]: the three-step auth key exchange
//! * [`auth_data`] and [`msg_id`]: per-connection session state
//! * [`encrypted`], [`gzip`] and [`inbound`]: MTProto 2.0 envelopes and
//!   classification of what comes out of them

#![deny(unsafe_code)]

pub mod auth_data;
pub mod authentication;
pub mod dh_prime;
pub mod encrypted;
pub mod gzip;
pub mod inbound;
pub mod msg_id;
pub mod plain;
pub mod transport;

pub use auth_data::AuthData;
pub use dh_prime::DhPrimeCache;
pub use encrypted::{DecryptedMessage, EnvelopeError};
pub use inbound::{RpcAnswer, ServiceMessage};
pub use transport::{Abridged, Full, Intermediate, Transport};
