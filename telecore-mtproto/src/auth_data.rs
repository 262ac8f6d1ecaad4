//! Per-connection session state.

use std::time::{SystemTime, UNIX_EPOCH};

use telecore_crypto::{AuthKey, fill_random};

use crate::msg_id::{self, InboundMessageIdRegister, MsgIdError};

/// Inbound ids may lag the server clock by this many seconds.
const MAX_PAST_SECS: i64 = 300;
/// Inbound ids may run ahead of the server clock by this many seconds.
const MAX_FUTURE_SECS: i64 = 30;

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn random_session_id() -> i64 {
    let mut buf = [0u8; 8];
    fill_random(&mut buf);
    i64::from_le_bytes(buf)
}

/// Authorization key, salt, session id and the counters that go with them.
///
/// One `AuthData` belongs to exactly one connection. It survives socket
/// reconnects; only [`reset_session`](Self::reset_session) starts a fresh
/// server-side session.
#[derive(Clone, Debug)]
pub struct AuthData {
    auth_key: Option<AuthKey>,
    server_salt: i64,
    session_id: i64,
    old_session_id: i64,
    time_offset: i32,
    last_message_id: i64,
    seq_no: i32,
    unauthorized: bool,
    inbound: InboundMessageIdRegister,
}

impl AuthData {
    pub fn new(auth_key: Option<AuthKey>, register_capacity: usize) -> Self {
        Self {
            auth_key,
            server_salt: 0,
            session_id: random_session_id(),
            old_session_id: 0,
            time_offset: 0,
            last_message_id: 0,
            seq_no: 0,
            unauthorized: false,
            inbound: InboundMessageIdRegister::new(register_capacity),
        }
    }

    // ─── Key material ────────────────────────────────────────────────────────

    pub fn auth_key(&self) -> Option<&AuthKey> { self.auth_key.as_ref() }

    /// Install a key fresh out of the handshake.
    pub fn set_auth_key(&mut self, key: AuthKey, server_salt: i64, time_offset: i32) {
        self.auth_key = Some(key);
        self.server_salt = server_salt;
        self.time_offset = time_offset;
        self.last_message_id = 0;
    }

    /// Forget the key so the next connect re-runs the handshake.
    pub fn clear_auth_key(&mut self) {
        self.auth_key = None;
    }

    pub fn server_salt(&self) -> i64 { self.server_salt }

    pub fn set_server_salt(&mut self, salt: i64) { self.server_salt = salt; }

    // ─── Session ─────────────────────────────────────────────────────────────

    pub fn session_id(&self) -> i64 { self.session_id }

    /// Id of the session abandoned by the last reset, or 0.
    pub fn old_session_id(&self) -> i64 { self.old_session_id }

    /// Return and clear the abandoned session id.
    pub fn take_old_session_id(&mut self) -> i64 {
        std::mem::take(&mut self.old_session_id)
    }

    /// Abandon the current server-side session and start a new one.
    pub fn reset_session(&mut self) {
        self.old_session_id = self.session_id;
        self.session_id = random_session_id();
        self.seq_no = 0;
        self.inbound.clear();
    }

    pub fn is_unauthorized(&self) -> bool { self.unauthorized }

    pub fn set_unauthorized(&mut self, unauthorized: bool) { self.unauthorized = unauthorized; }

    // ─── Outbound counters ───────────────────────────────────────────────────

    pub fn next_message_id(&mut self) -> i64 {
        self.next_message_id_at(unix_millis())
    }

    pub fn next_message_id_at(&mut self, unix_millis: i64) -> i64 {
        let id = msg_id::new_message_id(unix_millis, self.time_offset, self.last_message_id);
        self.last_message_id = id;
        id
    }

    pub fn last_message_id(&self) -> i64 { self.last_message_id }

    /// Baseline subsequent ids on `msg_id`, as after `new_session_created`.
    pub fn set_last_message_id(&mut self, msg_id: i64) {
        self.last_message_id = msg_id;
    }

    /// Odd, advancing numbers for content-related messages; even for the rest.
    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.seq_no * 2 + 1;
            self.seq_no += 1;
            n
        } else {
            self.seq_no * 2
        }
    }

    // ─── Clock ───────────────────────────────────────────────────────────────

    pub fn time_offset(&self) -> i32 { self.time_offset }

    /// Re-derive the clock offset from a server timestamp in seconds.
    ///
    /// A jump of more than 3 seconds drops the message-id baseline so ids
    /// follow the corrected clock.
    pub fn update_time_offset(&mut self, server_time: i64) {
        let now = unix_millis().div_euclid(1000);
        let offset = (server_time - now) as i32;
        if (self.time_offset - offset).abs() > 3 {
            self.last_message_id = 0;
        }
        self.time_offset = offset;
    }

    // ─── Inbound ─────────────────────────────────────────────────────────────

    /// Accept or reject an inbound message id, remembering accepted ones.
    pub fn validate_inbound(&mut self, msg_id: i64) -> Result<(), MsgIdError> {
        self.validate_inbound_at(msg_id, unix_millis().div_euclid(1000))
    }

    pub fn validate_inbound_at(&mut self, msg_id: i64, local_secs: i64) -> Result<(), MsgIdError> {
        if msg_id & 1 == 0 {
            return Err(MsgIdError::Even { msg_id });
        }
        let server_time = local_secs + self.time_offset as i64;
        let sent = msg_id::message_time(msg_id);
        if sent <= server_time - MAX_PAST_SECS || sent >= server_time + MAX_FUTURE_SECS {
            return Err(MsgIdError::InvalidTime { msg_id, server_time });
        }
        self.inbound.insert(msg_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn server_id(secs: i64, n: i64) -> i64 {
        (secs << 32) | (n * 4 + 1)
    }

    #[test]
    fn seq_numbers() {
        let mut auth = AuthData::new(None, 16);
        assert_eq!(auth.next_seq_no(false), 0);
        assert_eq!(auth.next_seq_no(true), 1);
        assert_eq!(auth.next_seq_no(true), 3);
        assert_eq!(auth.next_seq_no(false), 4);
        auth.reset_session();
        assert_eq!(auth.next_seq_no(true), 1);
    }

    #[test]
    fn message_ids_strictly_increase_even_with_same_clock() {
        let mut auth = AuthData::new(None, 16);
        let a = auth.next_message_id_at(NOW * 1000);
        let b = auth.next_message_id_at(NOW * 1000);
        let c = auth.next_message_id_at(NOW * 1000 - 5_000);
        assert!(a < b && b < c);
        assert_eq!(c % 4, 0);
    }

    #[test]
    fn inbound_validation() {
        let mut auth = AuthData::new(None, 16);
        let id = server_id(NOW, 1);
        auth.validate_inbound_at(id, NOW).unwrap();
        assert_eq!(auth.validate_inbound_at(id, NOW), Err(MsgIdError::Duplicate { msg_id: id }));
        assert_eq!(
            auth.validate_inbound_at(id + 3, NOW),
            Err(MsgIdError::Even { msg_id: id + 3 })
        );

        let stale = server_id(NOW - 300, 2);
        assert!(matches!(auth.validate_inbound_at(stale, NOW), Err(MsgIdError::InvalidTime { .. })));
        let future = server_id(NOW + 30, 3);
        assert!(matches!(auth.validate_inbound_at(future, NOW), Err(MsgIdError::InvalidTime { .. })));
        auth.validate_inbound_at(server_id(NOW + 29, 4), NOW).unwrap();
    }

    #[test]
    fn reset_keeps_old_session_for_destroy() {
        let mut auth = AuthData::new(None, 16);
        let first = auth.session_id();
        auth.reset_session();
        assert_ne!(auth.session_id(), first);
        assert_eq!(auth.take_old_session_id(), first);
        assert_eq!(auth.old_session_id(), 0);
    }
}
