//! # telecore-client
//!
//! Async MTProto connections on tokio.
//!
//! ## Features
//! - One task per [`Connection`]: auth key generation, session
//!   initialization, pings, acknowledgments and automatic recovery from
//!   bad-salt, bad-msg and resend notifications
//! - Calls are batched into containers together with pending acks and
//!   state requests, and gzip-packed when large
//! - Reconnection with pluggable [`ReconnectionStrategy`]
//! - [`ClientGroup`]: main, upload and download connections per DC with
//!   load-based auto-shift and idle eviction
//! - Pluggable [`Store`] for auth keys and DC options, and an
//!   [`UpdateDispatcher`] for server-pushed updates
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telecore_client::{Config, Connection, DcId, DcOptions};
//!
//! # async fn f() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(Config::with_api_id(12345));
//! let dc = DcOptions::default().find(DcId::Main, 2).cloned().ok_or("no DC2")?;
//! let connection = Connection::connect(config, dc, DcId::Main);
//! connection.ready().await?;
//! let pong = connection
//!     .invoke(&telecore_tl::mtproto::Ping { ping_id: 1 })
//!     .await?;
//! println!("pong for {}", pong.ping_id);
//! # Ok(()) }
//! ```

#![deny(unsafe_code)]

mod config;
mod connection;
mod errors;
mod group;
mod outbound;
mod request;
mod service;
pub mod dc;
pub mod reconnect;
pub mod stats;
pub mod store;
pub mod update;

pub use config::{Config, GroupConfig, TransportKind};
pub use connection::{Connection, ConnectionState};
pub use dc::{DataCenter, DcId, DcKind, DcOptions, Shift};
pub use errors::{ConnectionError, InvocationError, ProtocolError, RpcError};
pub use group::{ClientGroup, Selection, select};
pub use reconnect::{
    ExponentialBackoff, FixedInterval, Immediately, ReconnectionContext, ReconnectionStrategy,
};
pub use request::RawMethod;
pub use stats::Stats;
pub use store::{BinaryFileStore, InMemoryStore, Store};
pub use update::{ChannelDispatcher, IgnoreUpdates, UpdateDispatcher, UpdateStream};
