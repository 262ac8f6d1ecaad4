//! Encrypted MTProto 2.0 envelopes.
//!
//! The plaintext inside every encrypted frame is
//!
//! ```text
//! salt:       i64
//! session_id: i64
//! msg_id:     i64
//! seq_no:     i32
//! length:     i32
//! body:       [u8; length]
//! padding:    12..=1024 random bytes
//! ```
//!
//! [`seal_envelope`] and [`open_envelope`] work for either side of the
//! connection. [`seal`] and [`open`] are the client-side wrappers that
//! consult [`AuthData`].

use std::fmt;

use telecore_crypto::{AuthKey, EncryptedData, Side, decrypt_data_v2, encrypt_data_v2};

use crate::auth_data::AuthData;
use crate::msg_id::MsgIdError;

const HEADER_LEN: usize = 8 + 8 + 8 + 4 + 4;
const MIN_PADDING: usize = 12;
const MAX_PADDING: usize = 1024;

/// Errors from sealing or opening an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    /// No authorization key is installed yet.
    NoAuthKey,
    /// The crypto layer rejected the frame (key id or msg_key mismatch).
    Crypto(telecore_crypto::DecryptError),
    /// The decrypted plaintext is shorter than the fixed header.
    FrameTooShort { len: usize },
    /// The frame belongs to another session.
    SessionMismatch { got: i64, expected: i64 },
    /// The declared body length is negative, misaligned or too large.
    BadBodyLength { len: i32 },
    /// The padding is outside 12..=1024 bytes.
    BadPadding { len: usize },
    /// Replay protection rejected the message id.
    InvalidMessageId(MsgIdError),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAuthKey => write!(f, "no auth key"),
            Self::Crypto(e) => write!(f, "crypto: {e}"),
            Self::FrameTooShort { len } => write!(f, "decrypted frame too short: {len} bytes"),
            Self::SessionMismatch { got, expected } => {
                write!(f, "session_id mismatch: got {got:#x}, expected {expected:#x}")
            }
            Self::BadBodyLength { len } => write!(f, "bad body length: {len}"),
            Self::BadPadding { len } => write!(f, "bad padding length: {len}"),
            Self::InvalidMessageId(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

impl From<telecore_crypto::DecryptError> for EnvelopeError {
    fn from(e: telecore_crypto::DecryptError) -> Self { Self::Crypto(e) }
}

impl From<MsgIdError> for EnvelopeError {
    fn from(e: MsgIdError) -> Self { Self::InvalidMessageId(e) }
}

/// A decrypted message with its header fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub salt:       i64,
    pub session_id: i64,
    pub msg_id:     i64,
    pub seq_no:     i32,
    pub body:       Vec<u8>,
}

/// Build and encrypt an envelope as `side`.
pub fn seal_envelope(
    auth_key:   &AuthKey,
    side:       Side,
    salt:       i64,
    session_id: i64,
    msg_id:     i64,
    seq_no:     i32,
    body:       &[u8],
) -> EncryptedData {
    let mut plain = Vec::with_capacity(HEADER_LEN + body.len());
    plain.extend(salt.to_le_bytes());
    plain.extend(session_id.to_le_bytes());
    plain.extend(msg_id.to_le_bytes());
    plain.extend(seq_no.to_le_bytes());
    plain.extend((body.len() as i32).to_le_bytes());
    plain.extend_from_slice(body);
    encrypt_data_v2(&plain, auth_key, side)
}

/// Decrypt a frame produced by `sender` and check its length fields.
///
/// Session and message-id checks are left to the caller.
pub fn open_envelope(
    auth_key: &AuthKey,
    sender:   Side,
    frame:    &mut [u8],
) -> Result<DecryptedMessage, EnvelopeError> {
    let plain = decrypt_data_v2(frame, auth_key, sender)?;
    if plain.len() < HEADER_LEN {
        return Err(EnvelopeError::FrameTooShort { len: plain.len() });
    }

    let read_i64 = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&plain[at..at + 8]);
        i64::from_le_bytes(b)
    };
    let salt       = read_i64(0);
    let session_id = read_i64(8);
    let msg_id     = read_i64(16);
    let seq_no     = i32::from_le_bytes([plain[24], plain[25], plain[26], plain[27]]);
    let len        = i32::from_le_bytes([plain[28], plain[29], plain[30], plain[31]]);

    let available = plain.len() - HEADER_LEN;
    if len < 0 || len % 4 != 0 || len as usize > available {
        return Err(EnvelopeError::BadBodyLength { len });
    }
    let padding = available - len as usize;
    if !(MIN_PADDING..=MAX_PADDING).contains(&padding) {
        return Err(EnvelopeError::BadPadding { len: padding });
    }

    let body = plain[HEADER_LEN..HEADER_LEN + len as usize].to_vec();
    Ok(DecryptedMessage { salt, session_id, msg_id, seq_no, body })
}

/// Encrypt an outbound client message under the current session.
pub fn seal(auth: &AuthData, msg_id: i64, seq_no: i32, body: &[u8]) -> Result<EncryptedData, EnvelopeError> {
    let key = auth.auth_key().ok_or(EnvelopeError::NoAuthKey)?;
    Ok(seal_envelope(key, Side::Client, auth.server_salt(), auth.session_id(), msg_id, seq_no, body))
}

/// Decrypt and validate an inbound server frame.
pub fn open(auth: &mut AuthData, frame: &mut [u8]) -> Result<DecryptedMessage, EnvelopeError> {
    let key = auth.auth_key().ok_or(EnvelopeError::NoAuthKey)?;
    let message = open_envelope(key, Side::Server, frame)?;
    if message.session_id != auth.session_id() {
        return Err(EnvelopeError::SessionMismatch {
            got: message.session_id,
            expected: auth.session_id(),
        });
    }
    auth.validate_inbound(message.msg_id)?;
    Ok(message)
}
