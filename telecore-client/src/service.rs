//! Inbound frames: decryption and reaction to service messages.

use tokio::time::Instant;

use telecore_mtproto::inbound::{self, RpcAnswer, ServiceMessage};
use telecore_mtproto::encrypted;
use telecore_tl::mtproto::{MsgsStateReq, Pong};
use telecore_tl::{Deserializable, Serializable, schema};

use crate::errors::{ConnectionError, InvocationError, RpcError};
use crate::outbound::Sender;
use crate::request::Request;

/// Transport error codes are small negative numbers; quick-ack tokens have
/// the high bit set and are far below this range.
fn is_transport_error(code: i32) -> bool {
    code < 0 && code > -1000
}

impl Sender {
    /// Handle one payload produced by the transport.
    pub fn handle_frame(&mut self, mut payload: Vec<u8>, now: Instant) -> Result<(), ConnectionError> {
        if payload.len() == 4 {
            let code = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if self.supports_quick_ack() && !is_transport_error(code) {
                tracing::debug!("[{}] quick ack {:#010x}", self.tag, code as u32);
                return Ok(());
            }
            return Err(ConnectionError::Transport(code));
        }

        let message = encrypted::open(&mut self.auth, &mut payload)?;
        self.handle_message(message.msg_id, &message.body, now)
    }

    /// React to one decrypted message body (recursing into containers).
    pub fn handle_message(&mut self, msg_id: i64, body: &[u8], now: Instant) -> Result<(), ConnectionError> {
        match inbound::parse(body)? {
            ServiceMessage::RpcResult { req_msg_id, answer } => self.on_rpc_result(req_msg_id, answer, now)?,
            ServiceMessage::Container(messages) => {
                tracing::trace!("[{}] container {msg_id:#x} with {} messages", self.tag, messages.len());
                for message in messages {
                    self.handle_message(message.msg_id, &message.body, now)?;
                }
            }
            ServiceMessage::Updates(updates) => {
                tracing::trace!("[{}] updates in {msg_id:#x}", self.tag);
                self.updates.publish(updates);
                self.queue_ack(msg_id);
            }
            ServiceMessage::Pong(pong) => self.on_pong(pong),
            ServiceMessage::NewSessionCreated(created) => {
                tracing::debug!(
                    "[{}] new session created, first msg_id {:#x}",
                    self.tag, created.first_msg_id
                );
                self.auth.set_server_salt(created.server_salt);
                self.auth.set_last_message_id(created.first_msg_id);
                self.queue_ack(msg_id);
            }
            ServiceMessage::MsgsAck(ack) => {
                tracing::debug!("[{}] server acknowledged {:x?}", self.tag, ack.msg_ids);
            }
            ServiceMessage::BadMsgNotification(bad) => {
                tracing::debug!(
                    "[{}] bad msg {:#x}, code {}",
                    self.tag, bad.bad_msg_id, bad.error_code
                );
                self.auth.update_time_offset(msg_id >> 32);
                self.resend_unwrapped(bad.bad_msg_id, now)?;
            }
            ServiceMessage::BadServerSalt(bad) => {
                tracing::debug!("[{}] updating server salt for {:#x}", self.tag, bad.bad_msg_id);
                self.auth.set_server_salt(bad.new_server_salt);
                self.auth.update_time_offset(msg_id >> 32);
                self.resend_unwrapped(bad.bad_msg_id, now)?;
            }
            ServiceMessage::MsgsStateInfo(info) => self.on_state_info(info.req_msg_id, &info.info, now)?,
            ServiceMessage::MsgsAllInfo(info) => {
                tracing::debug!("[{}] state of {} messages reported", self.tag, info.msg_ids.len());
            }
            ServiceMessage::MsgDetailedInfo(info) => {
                tracing::debug!(
                    "[{}] detailed info for {:#x}, answer {:#x}",
                    self.tag, info.msg_id, info.answer_msg_id
                );
                self.queue_ack(info.answer_msg_id);
            }
            ServiceMessage::MsgNewDetailedInfo(info) => {
                tracing::debug!("[{}] detailed info, answer {:#x}", self.tag, info.answer_msg_id);
                self.queue_ack(info.answer_msg_id);
            }
            ServiceMessage::MsgResendReq(req) => {
                for id in req.msg_ids {
                    self.resend_unwrapped(id, now)?;
                }
            }
            ServiceMessage::DestroySession(res) => {
                tracing::debug!("[{}] destroy_session answered: {res:?}", self.tag);
            }
            ServiceMessage::Unknown { constructor_id, .. } => {
                tracing::warn!("[{}] Unhandled payload {constructor_id:#010x} in {msg_id:#x}", self.tag);
            }
        }
        Ok(())
    }

    fn on_rpc_result(&mut self, req_msg_id: i64, answer: RpcAnswer, now: Instant) -> Result<(), ConnectionError> {
        let Some(request) = self.requests.remove(&req_msg_id) else {
            tracing::debug!("[{}] rpc result for unknown request {req_msg_id:#x}", self.tag);
            return Ok(());
        };
        self.settle(&request);
        self.queue_ack(req_msg_id);

        match answer {
            RpcAnswer::Err(error) => {
                if error.error_code == 401 {
                    self.auth.set_unauthorized(true);
                }
                tracing::debug!(
                    "[{}] rpc error for {req_msg_id:#x}: {} {}",
                    self.tag, error.error_code, error.error_message
                );
                let method = request.method().map(|m| m.constructor_id);
                let error = RpcError::from_telegram(error.error_code, &error.error_message).with_method(method);
                request.fail(InvocationError::Rpc(error));
            }
            RpcAnswer::Ok(bytes) => {
                tracing::debug!("[{}] rpc result for {req_msg_id:#x}", self.tag);
                let authorized = self.auth.is_unauthorized()
                    && inbound::constructor_id(&bytes).is_ok_and(schema::is_auth_success);
                request.resolve(bytes);

                if authorized {
                    self.auth.set_unauthorized(false);
                    if !self.delayed_until_auth.is_empty() {
                        tracing::debug!(
                            "[{}] authorized; flushing {} delayed requests",
                            self.tag, self.delayed_until_auth.len()
                        );
                        let delayed = std::mem::take(&mut self.delayed_until_auth);
                        self.resend_queue.extend(delayed);
                        self.resend(now)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn on_pong(&mut self, pong: Pong) {
        tracing::trace!("[{}] pong for {:#x}", self.tag, pong.msg_id);
        if self.keepalive == Some(pong.ping_id) {
            self.keepalive = None;
        }
        if let Some(request) = self.requests.remove(&pong.msg_id) {
            self.settle(&request);
            request.resolve(pong.to_bytes());
        }
    }

    fn on_state_info(&mut self, req_msg_id: i64, info: &[u8], now: Instant) -> Result<(), ConnectionError> {
        let Some(request) = self.requests.remove(&req_msg_id) else {
            tracing::debug!("[{}] state info for unknown request {req_msg_id:#x}", self.tag);
            return Ok(());
        };
        let Some(method) = request.method() else { return Ok(()) };
        let asked = match MsgsStateReq::from_bytes(&method.body) {
            Ok(req) => req.msg_ids,
            Err(e) => {
                tracing::warn!("[{}] state info answers {req_msg_id:#x}, not a state request: {e}", self.tag);
                return Ok(());
            }
        };
        if asked.len() != info.len() {
            tracing::error!(
                "[{}] received not all states for {req_msg_id:#x}: expected {}, got {}",
                self.tag, asked.len(), info.len()
            );
            return Ok(());
        }
        self.settle(&request);

        for (id, state) in asked.into_iter().zip(info.iter().map(|b| b & 7)) {
            match state {
                1..=3 => self.resend_unwrapped(id, now)?,
                4 => {
                    let finished = self.requests.get(&id).is_some_and(|r| !r.expects_result());
                    if finished {
                        if let Some(sub) = self.requests.remove(&id) {
                            self.settle(&sub);
                        }
                    }
                }
                other => tracing::debug!("[{}] unknown state {other} for {id:#x}", self.tag),
            }
        }
        Ok(())
    }

    /// Pull `msg_id` (and its container, if any) out of the table and send
    /// the contents again.
    pub(crate) fn resend_unwrapped(&mut self, msg_id: i64, now: Instant) -> Result<(), ConnectionError> {
        let Some(request) = self.requests.remove(&msg_id) else {
            return Ok(());
        };
        tracing::debug!("[{}] queued {msg_id:#x} for resending", self.tag);

        match request {
            Request::Container { msg_ids, .. } => self.unwrap_container(&msg_ids, now),
            Request::Containerized { container_msg_id, .. } => {
                self.requeue(request, now);
                if let Some(Request::Container { msg_ids, .. }) = self.requests.remove(&container_msg_id) {
                    self.unwrap_container(&msg_ids, now);
                }
            }
            standalone => self.requeue(standalone, now),
        }

        self.delay_resend(now)?;
        Ok(())
    }

    fn unwrap_container(&mut self, msg_ids: &[i64], now: Instant) {
        for id in msg_ids {
            // absent members were already answered
            if let Some(inner) = self.requests.remove(id) {
                self.requeue(inner, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::tests::{drain, query, sender};
    use crate::outbound::RESEND_DELAY;
    use std::time::Duration;
    use telecore_tl::mtproto::{
        BadServerSalt, Message, MessageContainer, MsgsAck, MsgsStateInfo, NewSessionCreated, Ping, RpcError as TlRpcError,
        RpcResult,
    };
    use telecore_tl::{Blob, RawVec};

    /// An odd, server-style msg_id for the current second.
    fn server_msg(n: i64) -> i64 {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        (secs << 32) | (n * 4 + 1)
    }

    fn rpc_result(req_msg_id: i64, answer: Vec<u8>) -> Vec<u8> {
        RpcResult { req_msg_id, result: Blob(answer) }.to_bytes()
    }

    fn rpc_error(req_msg_id: i64, code: i32, message: &str) -> Vec<u8> {
        let error = TlRpcError { error_code: code, error_message: message.into() };
        rpc_result(req_msg_id, error.to_bytes())
    }

    #[tokio::test]
    async fn rpc_result_resolves_and_queues_ack() {
        let mut sender = sender();
        let now = Instant::now();
        let (request, rx) = query(8);
        sender.write(request, now).unwrap();
        let id = drain(&mut sender)[0].0;

        sender.handle_message(server_msg(0), &rpc_result(id, vec![1, 0, 0, 0]), now).unwrap();
        assert_eq!(rx.await.unwrap(), Ok(vec![1, 0, 0, 0]));
        assert_eq!(sender.acks, vec![id]);
        assert!(sender.requests.is_empty());
        assert_eq!(sender.stats.queries(), 0);
    }

    #[tokio::test]
    async fn rpc_error_carries_method_and_401_unauthorizes() {
        let mut sender = sender();
        let now = Instant::now();
        let (request, rx) = query(8);
        sender.write(request, now).unwrap();
        let id = drain(&mut sender)[0].0;

        sender.handle_message(server_msg(0), &rpc_error(id, 401, "AUTH_KEY_UNREGISTERED"), now).unwrap();
        let Err(InvocationError::Rpc(error)) = rx.await.unwrap() else { panic!("expected rpc error") };
        assert_eq!(error.code, 401);
        assert_eq!(error.name, "AUTH_KEY_UNREGISTERED");
        assert_eq!(error.method, Some(0x1234_5678));
        assert!(sender.auth.is_unauthorized());
    }

    #[tokio::test]
    async fn auth_success_flushes_delayed_requests() {
        let mut sender = sender();
        let now = Instant::now();
        sender.auth.set_unauthorized(true);

        let (delayed, delayed_rx) = query(8);
        sender.write(delayed, now).unwrap();
        assert_eq!(sender.delayed_until_auth.len(), 1);

        let (tx, _rx) = tokio::sync::oneshot::channel();
        let mut body = schema::AUTH_CHECK_PASSWORD.to_le_bytes().to_vec();
        body.extend([0; 4]);
        sender.write(Request::query(crate::request::RawMethod::from_body(body), tx), now).unwrap();
        let auth_id = drain(&mut sender)[0].0;

        let answer = schema::AUTH_AUTHORIZATION.to_le_bytes().to_vec();
        sender.handle_message(server_msg(0), &rpc_result(auth_id, answer), now).unwrap();
        assert!(!sender.auth.is_unauthorized());
        assert!(sender.delayed_until_auth.is_empty());

        // the delayed query went out with the pending ack
        let frames = drain(&mut sender);
        assert_eq!(frames.len(), 1);
        let inner = MessageContainer::from_bytes(&frames[0].1).unwrap().messages.0;
        let delayed_id = inner.last().unwrap().msg_id;

        sender.handle_message(server_msg(1), &rpc_result(delayed_id, vec![7; 4]), now).unwrap();
        assert_eq!(delayed_rx.await.unwrap(), Ok(vec![7; 4]));
    }

    #[tokio::test]
    async fn bad_server_salt_resends_whole_container() {
        let mut sender = sender();
        let now = Instant::now();
        sender.queue_ack(77);
        let (request, rx) = query(8);
        sender.write(request, now).unwrap();
        let container_id = drain(&mut sender)[0].0;

        let bad = BadServerSalt { bad_msg_id: container_id, bad_msg_seqno: 2, error_code: 48, new_server_salt: 99 };
        sender.handle_message(server_msg(0), &bad.to_bytes(), now).unwrap();
        assert_eq!(sender.auth.server_salt(), 99);
        assert!(sender.requests.is_empty());
        assert_eq!(sender.acks, vec![77]);
        assert_eq!(sender.resend_queue.len(), 1);
        assert_eq!(sender.resend_at, Some(now + RESEND_DELAY));

        sender.fire_resend(now + RESEND_DELAY).unwrap();
        let frames = drain(&mut sender);
        let inner = MessageContainer::from_bytes(&frames[0].1).unwrap().messages.0;
        assert_eq!(MsgsAck::from_bytes(&inner[0].body).unwrap().msg_ids, vec![77]);

        sender.handle_message(server_msg(1), &rpc_result(inner[1].msg_id, vec![3; 4]), now).unwrap();
        assert_eq!(rx.await.unwrap(), Ok(vec![3; 4]));
    }

    #[test]
    fn state_info_drops_received_fire_and_forget_messages() {
        let mut sender = sender();
        let t0 = Instant::now();
        sender.queue_ack(11);
        let (first, _rx1) = query(8);
        sender.write(first, t0).unwrap();
        let first_container = MessageContainer::from_bytes(&drain(&mut sender)[0].1).unwrap().messages.0;
        let ack_id = first_container[0].msg_id;
        let query_id = first_container[1].msg_id;

        let (second, _rx2) = query(8);
        sender.write(second, t0 + Duration::from_millis(400)).unwrap();
        let inner = MessageContainer::from_bytes(&drain(&mut sender)[0].1).unwrap().messages.0;
        let state_req_id = inner[0].msg_id;
        let asked = MsgsStateReq::from_bytes(&inner[0].body).unwrap().msg_ids;
        let mut expected = vec![ack_id, query_id];
        expected.sort_unstable();
        assert_eq!(asked, expected);

        let info = MsgsStateInfo { req_msg_id: state_req_id, info: vec![4, 4] };
        sender.handle_message(server_msg(0), &info.to_bytes(), t0).unwrap();
        assert!(!sender.requests.contains_key(&ack_id));
        assert!(sender.requests.contains_key(&query_id));
        assert!(!sender.requests.contains_key(&state_req_id));
    }

    #[test]
    fn server_containers_are_walked() {
        let mut sender = sender();
        let now = Instant::now();
        let created = NewSessionCreated { first_msg_id: 40, unique_id: 1, server_salt: 5 };
        let updates = schema::UPDATES_TOO_LONG.to_le_bytes().to_vec();
        let (first, second) = (server_msg(0), server_msg(1));
        let container = MessageContainer {
            messages: RawVec(vec![
                Message { msg_id: first, seq_no: 1, body: created.to_bytes() },
                Message { msg_id: second, seq_no: 3, body: updates },
            ]),
        };
        sender.handle_message(server_msg(2), &container.to_bytes(), now).unwrap();
        assert_eq!(sender.auth.server_salt(), 5);
        assert_eq!(sender.acks, vec![first, second]);
    }

    #[tokio::test]
    async fn only_the_keepalive_pong_clears_the_ping() {
        let mut sender = sender();
        let now = Instant::now();
        let (tx, rx) = tokio::sync::oneshot::channel();
        sender.write(Request::query(crate::request::RawMethod::new(&Ping { ping_id: 1 }), tx), now).unwrap();
        let user_ping = drain(&mut sender)[0].0;
        sender.send_ping(2, now).unwrap();
        let keepalive = drain(&mut sender)[0].0;
        assert!(sender.ping_in_flight());

        let pong = Pong { msg_id: user_ping, ping_id: 1 };
        sender.handle_message(server_msg(0), &pong.to_bytes(), now).unwrap();
        assert_eq!(rx.await.unwrap(), Ok(pong.to_bytes()));
        assert!(sender.ping_in_flight());

        let pong = Pong { msg_id: keepalive, ping_id: 2 };
        sender.handle_message(server_msg(1), &pong.to_bytes(), now).unwrap();
        assert!(!sender.ping_in_flight());
    }

    #[test]
    fn transport_error_and_quick_ack_frames() {
        let mut sender = sender();
        let now = Instant::now();
        let err = sender.handle_frame((-404i32).to_le_bytes().to_vec(), now).unwrap_err();
        assert!(matches!(err, ConnectionError::Transport(-404)));

        // without quick-ack support every 4-byte frame is an error code
        let token = (0x8000_1234u32 as i32).to_le_bytes().to_vec();
        assert!(sender.handle_frame(token, now).is_err());
    }
}
