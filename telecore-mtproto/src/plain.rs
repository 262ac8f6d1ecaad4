//! Plaintext messages, used only while negotiating an authorization key.
//!
//! ```text
//! auth_key_id:long  (always 0)
//! message_id:long
//! message_data_length:int
//! message_data:bytes
//! ```

use std::fmt;

/// Errors from [`PlainMessage::from_frame`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlainError {
    /// Fewer than 20 bytes, or fewer than the declared length.
    TooShort { len: usize },
    /// The frame carried an authorization key id.
    NotPlaintext { auth_key_id: i64 },
    /// Bytes left over after the declared body.
    TrailingBytes { declared: usize, actual: usize },
}

impl fmt::Display for PlainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { len } => write!(f, "plaintext frame too short: {len} bytes"),
            Self::NotPlaintext { auth_key_id } => {
                write!(f, "expected plaintext frame, got auth_key_id {auth_key_id:#018x}")
            }
            Self::TrailingBytes { declared, actual } => {
                write!(f, "plaintext frame declares {declared} bytes but carries {actual}")
            }
        }
    }
}

impl std::error::Error for PlainError {}

/// A handshake message together with its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlainMessage {
    pub msg_id: i64,
    pub body: Vec<u8>,
}

impl PlainMessage {
    const HEADER_LEN: usize = 8 + 8 + 4;

    pub fn new(msg_id: i64, body: Vec<u8>) -> Self {
        Self { msg_id, body }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_LEN + self.body.len());
        buf.extend(0i64.to_le_bytes());
        buf.extend(self.msg_id.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Parse a frame received from the transport.
    pub fn from_frame(frame: &[u8]) -> Result<Self, PlainError> {
        if frame.len() < Self::HEADER_LEN {
            return Err(PlainError::TooShort { len: frame.len() });
        }
        let read_i64 = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&frame[at..at + 8]);
            i64::from_le_bytes(b)
        };
        let auth_key_id = read_i64(0);
        if auth_key_id != 0 {
            return Err(PlainError::NotPlaintext { auth_key_id });
        }
        let msg_id = read_i64(8);
        let declared = u32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]]) as usize;
        let actual = frame.len() - Self::HEADER_LEN;
        if actual < declared {
            return Err(PlainError::TooShort { len: frame.len() });
        }
        if actual > declared {
            return Err(PlainError::TrailingBytes { declared, actual });
        }
        Ok(Self { msg_id, body: frame[Self::HEADER_LEN..].to_vec() })
    }
}
