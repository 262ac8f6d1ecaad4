//! Connection and pool configuration.

use std::sync::Arc;
use std::time::Duration;

use telecore_crypto::rsa::PublicKeyRegistry;
use telecore_mtproto::{Abridged, DhPrimeCache, Full, Intermediate, Transport};
use telecore_tl::mtproto::{InitConnection, InvokeWithLayer};
use telecore_tl::{Blob, Serializable, schema};

use crate::reconnect::{ExponentialBackoff, ReconnectionStrategy};
use crate::request::RawMethod;
use crate::store::{InMemoryStore, Store};
use crate::update::{IgnoreUpdates, UpdateDispatcher};

// ─── TransportKind ────────────────────────────────────────────────────────────

/// Which MTProto transport framing to use.
///
/// | Variant      | Init bytes | Notes                                  |
/// |--------------|------------|----------------------------------------|
/// | Abridged     | `0xef`     | Smallest overhead                      |
/// | Intermediate | `0xeeeeeeee` | Optional quick acknowledgments       |
/// | Full         | none       | Adds seqno + CRC32                     |
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Abridged,
    Intermediate { quick_ack: bool },
    Full,
}

impl TransportKind {
    /// A fresh codec for one socket.
    pub fn build(&self) -> Box<dyn Transport> {
        match *self {
            Self::Abridged                  => Box::new(Abridged),
            Self::Intermediate { quick_ack } => Box::new(Intermediate::new(quick_ack)),
            Self::Full                      => Box::new(Full::new()),
        }
    }

    pub fn supports_quick_ack(&self) -> bool {
        matches!(self, Self::Intermediate { quick_ack: true })
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration shared by every connection created from it.
#[derive(Clone)]
pub struct Config {
    /// Which MTProto transport framing to use (default: Abridged).
    pub transport:   TransportKind,
    /// Where auth keys and DC state are kept (default: in memory).
    pub store:       Arc<dyn Store>,
    /// Receives server-pushed updates (default: dropped).
    pub updates:     Arc<dyn UpdateDispatcher>,
    pub reconnection: Arc<dyn ReconnectionStrategy>,
    /// Server RSA keys accepted during the handshake.
    pub keys:        Arc<PublicKeyRegistry>,
    /// DH primes already known to be safe.
    pub primes:      Arc<DhPrimeCache>,
    /// Sent as `invokeWithLayer(initConnection(..))` after every connect.
    /// `None` marks the connection ready as soon as the socket is up.
    pub init_connection: Option<InitConnection>,
    /// Bodies of at least this many bytes are sent `gzip_packed`.
    pub gzip_threshold: usize,
    pub connect_timeout: Duration,
    /// Time allowed for each of the three handshake round trips.
    pub handshake_step_timeout: Duration,
    pub ping_interval: Duration,
    /// Ping interval for media and CDN connections.
    pub media_ping_interval: Duration,
    /// Requests accepted while not ready; more are discarded.
    pub pending_capacity: usize,
    /// Inbound message ids remembered for replay protection.
    pub register_capacity: usize,
    /// Non-zero requests temporary keys valid for this many seconds.
    pub temp_key_expires_in: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport:              TransportKind::Abridged,
            store:                  Arc::new(InMemoryStore::new()),
            updates:                Arc::new(IgnoreUpdates),
            reconnection:           Arc::new(ExponentialBackoff::default()),
            keys:                   Arc::new(PublicKeyRegistry::builtin()),
            primes:                 Arc::new(DhPrimeCache::new()),
            init_connection:        Some(default_init_connection(0)),
            gzip_threshold:         16 * 1024,
            connect_timeout:        Duration::from_secs(10),
            handshake_step_timeout: Duration::from_secs(3),
            ping_interval:          Duration::from_secs(5),
            media_ping_interval:    Duration::from_secs(10),
            pending_capacity:       256,
            register_capacity:      telecore_mtproto::msg_id::DEFAULT_REGISTER_CAPACITY,
            temp_key_expires_in:    0,
        }
    }
}

impl Config {
    /// `initConnection` for `api_id`, describing this library and wrapping
    /// `help.getConfig`.
    pub fn with_api_id(api_id: i32) -> Self {
        Self { init_connection: Some(default_init_connection(api_id)), ..Self::default() }
    }

    /// The first request of every session, if any.
    pub(crate) fn init_request(&self) -> Option<RawMethod> {
        self.init_connection.as_ref().map(|init| {
            RawMethod::new(&InvokeWithLayer { layer: schema::LAYER, query: Blob(init.to_bytes()) })
        })
    }
}

fn default_init_connection(api_id: i32) -> InitConnection {
    InitConnection {
        api_id,
        device_model:     "telecore".into(),
        system_version:   std::env::consts::OS.into(),
        app_version:      env!("CARGO_PKG_VERSION").into(),
        system_lang_code: "en".into(),
        lang_pack:        String::new(),
        lang_code:        "en".into(),
        query:            Blob(schema::HELP_GET_CONFIG.to_le_bytes().to_vec()),
    }
}

// ─── GroupConfig ──────────────────────────────────────────────────────────────

/// Sizing and timing of a [`ClientGroup`](crate::ClientGroup).
#[derive(Clone, Copy, Debug)]
pub struct GroupConfig {
    /// Upload or download connections per DC.
    pub max_connections: usize,
    /// In-flight queries at which auto-shift opens another connection.
    pub load_threshold:  usize,
    pub sweep_interval:  Duration,
    /// Upload and download connections idle this long are closed.
    pub idle_timeout:    Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            load_threshold:  20,
            sweep_interval:  Duration::from_secs(60),
            idle_timeout:    Duration::from_secs(180),
        }
    }
}
