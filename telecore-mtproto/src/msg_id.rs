//! Message id generation and inbound replay protection.

use std::collections::VecDeque;
use std::fmt;

use telecore_crypto::fill_random;

/// Default number of inbound ids remembered per session.
pub const DEFAULT_REGISTER_CAPACITY: usize = 128;
/// Smallest register the session accepts.
pub const MIN_REGISTER_CAPACITY: usize = 8;

/// Why an inbound message id was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgIdError {
    /// Server ids are always odd.
    Even { msg_id: i64 },
    /// The embedded timestamp is more than 300s old or 30s ahead.
    InvalidTime { msg_id: i64, server_time: i64 },
    /// Already accepted.
    Duplicate { msg_id: i64 },
    /// Older than everything the full register still remembers.
    TooOld { msg_id: i64 },
}

impl fmt::Display for MsgIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Even { msg_id } => write!(f, "inbound msg_id {msg_id:#x} is even"),
            Self::InvalidTime { msg_id, server_time } => write!(
                f,
                "inbound msg_id {msg_id:#x} is outside the time window around {server_time}"
            ),
            Self::Duplicate { msg_id } => write!(f, "inbound msg_id {msg_id:#x} was already seen"),
            Self::TooOld { msg_id } => write!(f, "inbound msg_id {msg_id:#x} is older than the register"),
        }
    }
}

impl std::error::Error for MsgIdError {}

/// Build an outbound message id for local time `unix_millis` shifted by
/// `time_offset` seconds. The result is divisible by 4 and greater than `last`.
pub fn new_message_id(unix_millis: i64, time_offset: i32, last: i64) -> i64 {
    let secs = unix_millis.div_euclid(1000) + time_offset as i64;
    let millis = unix_millis.rem_euclid(1000);
    let mut rnd = [0u8; 4];
    fill_random(&mut rnd);
    let low = (u32::from_le_bytes(rnd) & 0x3f_fffc) as i64;

    let id = (secs << 32) | (millis << 22) | low;
    if id <= last { last + 4 } else { id }
}

/// Server time, in seconds, embedded in a message id.
pub fn message_time(msg_id: i64) -> i64 {
    msg_id >> 32
}

/// Sorted window of the most recent accepted inbound ids.
#[derive(Clone, Debug)]
pub struct InboundMessageIdRegister {
    ids: VecDeque<i64>,
    capacity: usize,
}

impl InboundMessageIdRegister {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_REGISTER_CAPACITY);
        Self { ids: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn len(&self) -> usize { self.ids.len() }

    pub fn is_empty(&self) -> bool { self.ids.is_empty() }

    pub fn contains(&self, msg_id: i64) -> bool {
        self.ids.binary_search(&msg_id).is_ok()
    }

    /// Record `msg_id`, evicting the oldest entry when full.
    ///
    /// Anything at or below the oldest remembered id is rejected, full or not.
    pub fn insert(&mut self, msg_id: i64) -> Result<(), MsgIdError> {
        let at = match self.ids.binary_search(&msg_id) {
            Ok(_) => return Err(MsgIdError::Duplicate { msg_id }),
            Err(at) => at,
        };
        if at == 0 && !self.ids.is_empty() {
            return Err(MsgIdError::TooOld { msg_id });
        }
        if self.ids.len() == self.capacity {
            self.ids.pop_front();
            self.ids.insert(at - 1, msg_id);
        } else {
            self.ids.insert(at, msg_id);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

impl Default for InboundMessageIdRegister {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTER_CAPACITY)
    }
}
