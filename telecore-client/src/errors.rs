//! Error types for telecore-client.
//!
//! [`ConnectionError`] stays inside a connection: it is logged, the socket is
//! torn down and the reconnection strategy decides what happens next.
//! [`InvocationError`] is what callers of `invoke` see.

use std::{fmt, io, sync::Arc};

use telecore_mtproto::authentication;
use telecore_mtproto::encrypted::EnvelopeError;
use telecore_mtproto::inbound::DecodeError;
use telecore_mtproto::plain::PlainError;
use telecore_mtproto::transport::FrameError;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30), .. }`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
    /// Constructor id of the method that failed.
    pub method: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        if let Some(id) = self.method {
            write!(f, " caused by {id:#010x}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        // "FLOOD_WAIT_30" → name = "FLOOD_WAIT", value = Some(30)
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v), method: None };
                }
            }
        }
        Self { code, name: message.to_string(), value: None, method: None }
    }

    /// Attach the constructor id of the failed method.
    pub fn with_method(mut self, method: Option<u32>) -> Self {
        self.method = method;
        self
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_INVALID")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Returns the flood-wait duration in seconds, if this is a FLOOD_WAIT error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.code == 420 && self.name == "FLOOD_WAIT" {
            self.value.map(|v| v as u64)
        } else {
            None
        }
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from `invoke` on a connection or a group.
///
/// RPC errors are handed back as-is; the engine never retries them.
#[derive(Clone, Debug, PartialEq)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// The request could not be queued: the pending queue is full or the
    /// connection is closed.
    Discarded,
    /// The request was in flight or queued when the socket was torn down or
    /// the connection was closed.
    Cancelled,
    /// The response could not be decoded into the expected type.
    Deserialize(String),
    /// The connection task went away without answering.
    Dropped,
    /// The group could not route the request.
    Routing(String),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)         => write!(f, "{e}"),
            Self::Discarded      => write!(f, "request discarded"),
            Self::Cancelled      => write!(f, "request cancelled"),
            Self::Deserialize(s) => write!(f, "deserialize error: {s}"),
            Self::Dropped        => write!(f, "request dropped"),
            Self::Routing(s)     => write!(f, "routing error: {s}"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<telecore_tl::deserialize::Error> for InvocationError {
    fn from(e: telecore_tl::deserialize::Error) -> Self { Self::Deserialize(e.to_string()) }
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// If this is a FLOOD_WAIT error, returns how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _            => None,
        }
    }
}

// ─── ProtocolError ────────────────────────────────────────────────────────────

/// The peer sent something that violates the protocol, or the session is
/// not in a state to encrypt.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolError {
    /// Decryption, session id, message id or length checks failed.
    Envelope(EnvelopeError),
    Frame(FrameError),
    Plain(PlainError),
    Decode(DecodeError),
    /// Tried to encrypt without an authorization key.
    NoAuthKey,
    /// A body could not be gzip-packed.
    Gzip(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope(e) => write!(f, "{e}"),
            Self::Frame(e)    => write!(f, "framing: {e}"),
            Self::Plain(e)    => write!(f, "{e}"),
            Self::Decode(e)   => write!(f, "{e}"),
            Self::NoAuthKey   => write!(f, "no auth key"),
            Self::Gzip(e)     => write!(f, "gzip: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<EnvelopeError> for ProtocolError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::NoAuthKey => Self::NoAuthKey,
            e => Self::Envelope(e),
        }
    }
}

impl From<FrameError> for ProtocolError {
    fn from(e: FrameError) -> Self { Self::Frame(e) }
}

impl From<PlainError> for ProtocolError {
    fn from(e: PlainError) -> Self { Self::Plain(e) }
}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self { Self::Decode(e) }
}

// ─── ConnectionError ──────────────────────────────────────────────────────────

/// Why a connection lost its socket.
#[derive(Clone, Debug)]
pub enum ConnectionError {
    /// Socket failure, including a connect timeout.
    Io(Arc<io::Error>),
    /// The server answered with a 4-byte transport error code.
    Transport(i32),
    /// The authorization key exchange failed.
    Authorization(authentication::Error),
    Protocol(ProtocolError),
    /// A handshake step got no answer in time.
    HandshakeTimeout,
    /// A ping was still unanswered at the next ping tick.
    PingTimeout,
    /// The server rejected the connection's initialization request.
    Init(RpcError),
    /// The connection was closed on request.
    Closed,
}

impl ConnectionError {
    /// Whether a reconnection attempt makes sense after this error.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Init(_) | Self::Closed)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)            => write!(f, "I/O error: {e}"),
            Self::Transport(code)  => write!(f, "transport error {code}"),
            Self::Authorization(e) => write!(f, "auth key generation failed: {e}"),
            Self::Protocol(e)      => write!(f, "protocol violation: {e}"),
            Self::HandshakeTimeout => write!(f, "handshake timed out"),
            Self::PingTimeout      => write!(f, "ping timed out"),
            Self::Init(e)          => write!(f, "connection init rejected: {e}"),
            Self::Closed           => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e)            => Some(e.as_ref()),
            Self::Authorization(e) => Some(e),
            Self::Protocol(e)      => Some(e),
            Self::Init(e)          => Some(e),
            _                      => None,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self { Self::Io(Arc::new(e)) }
}

impl From<authentication::Error> for ConnectionError {
    fn from(e: authentication::Error) -> Self { Self::Authorization(e) }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self { Self::Protocol(e) }
}

impl From<EnvelopeError> for ConnectionError {
    fn from(e: EnvelopeError) -> Self { Self::Protocol(e.into()) }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self { Self::Protocol(e.into()) }
}

impl From<PlainError> for ConnectionError {
    fn from(e: PlainError) -> Self { Self::Protocol(e.into()) }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self { Self::Protocol(e.into()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flood_wait_suffix_is_split_off() {
        let e = RpcError::from_telegram(420, "FLOOD_WAIT_30");
        assert_eq!(e.name, "FLOOD_WAIT");
        assert_eq!(e.value, Some(30));
        assert_eq!(e.flood_wait_seconds(), Some(30));

        let e = RpcError::from_telegram(400, "PEER_ID_INVALID");
        assert_eq!(e.value, None);
        assert!(e.is("*_INVALID"));
        assert!(e.is("PEER_*"));
        assert!(!e.is("PEER"));
    }

    #[test]
    fn only_init_and_close_are_final() {
        assert!(ConnectionError::Transport(-404).is_resumable());
        assert!(ConnectionError::PingTimeout.is_resumable());
        assert!(ConnectionError::Protocol(ProtocolError::NoAuthKey).is_resumable());
        assert!(!ConnectionError::Closed.is_resumable());
        assert!(!ConnectionError::Init(RpcError::from_telegram(400, "API_ID_INVALID")).is_resumable());
    }
}
