//! The sans-IO half of a connection: request bookkeeping and encryption of
//! everything that leaves it.
//!
//! [`Sender`] owns the session's [`AuthData`], the table of sent messages
//! keyed by msg_id, the pending acknowledgments and the resend queues. It
//! never touches the socket; encrypted frames pile up in [`Sender::out`]
//! and the connection task writes them. Inbound handling lives in
//! [`crate::service`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use telecore_mtproto::{AuthData, encrypted, gzip};
use telecore_tl::mtproto::{Message, MessageContainer, MsgsAck, MsgsStateReq, PingDelayDisconnect};
use telecore_tl::{Deserializable, Identifiable, RawVec, Serializable, schema};

use crate::config::Config;
use crate::errors::{InvocationError, ProtocolError};
use crate::request::{RawMethod, Request};
use crate::stats::Stats;
use crate::update::UpdateDispatcher;

/// Most ids in one `msgs_ack` or `msgs_state_req`.
pub(crate) const MAX_IDS: usize = 8192;
/// Bodies at or above this size always travel alone.
pub(crate) const MAX_CONTAINER_LEN: usize = 1 << 15;
pub(crate) const MAX_CONTAINER_MESSAGES: usize = 1020;
/// Sent messages older than this are included in the next state request.
pub(crate) const STATE_REQUEST_DELAY: Duration = Duration::from_millis(300);
pub(crate) const RESEND_DELAY: Duration = Duration::from_millis(20);
/// Seconds the server waits for the next ping before closing the socket.
pub(crate) const PING_DISCONNECT_DELAY: i32 = 60;

/// An encrypted frame ready for the transport.
#[derive(Clone, Debug)]
pub(crate) struct Outgoing {
    pub frame:     Vec<u8>,
    /// Token the server echoes when it receives the frame.
    pub quick_ack: Option<i32>,
}

/// Whether `method` may be sent while the connection is unauthorized.
fn allowed_while_unauthorized(method: &RawMethod) -> bool {
    method.constructor_id == schema::INVOKE_WITH_LAYER || schema::is_auth_method(method.constructor_id)
}

/// `invokeWithLayer` inside a container makes the server answer -404.
fn can_containerize(method: &RawMethod) -> bool {
    method.constructor_id != schema::INVOKE_WITH_LAYER && method.body.len() < MAX_CONTAINER_LEN
}

pub(crate) struct Sender {
    pub(crate) tag:     String,
    pub(crate) auth:    AuthData,
    pub(crate) requests: HashMap<i64, Request>,
    pub(crate) acks:    Vec<i64>,
    pub(crate) resend_queue: VecDeque<Request>,
    pub(crate) delayed_until_auth: Vec<Request>,
    /// `ping_id` of the keepalive ping still waiting for its pong.
    pub(crate) keepalive: Option<i64>,
    pub(crate) resend_at: Option<Instant>,
    gzip_threshold:     usize,
    quick_ack:          bool,
    pub(crate) stats:   Arc<Stats>,
    pub(crate) updates: Arc<dyn UpdateDispatcher>,
    pub(crate) out:     Vec<Outgoing>,
}

impl Sender {
    pub fn new(tag: String, auth: AuthData, config: &Config, stats: Arc<Stats>) -> Self {
        Self {
            tag,
            auth,
            requests: HashMap::new(),
            acks: Vec::new(),
            resend_queue: VecDeque::new(),
            delayed_until_auth: Vec::new(),
            keepalive: None,
            resend_at: None,
            gzip_threshold: config.gzip_threshold,
            quick_ack: config.transport.supports_quick_ack(),
            stats,
            updates: Arc::clone(&config.updates),
            out: Vec::new(),
        }
    }

    pub fn supports_quick_ack(&self) -> bool { self.quick_ack }

    fn pack_body(&self, method: &RawMethod) -> Result<Vec<u8>, ProtocolError> {
        if method.body.len() < self.gzip_threshold {
            return Ok(method.body.clone());
        }
        let packed = gzip::pack(&method.body).map_err(|e| ProtocolError::Gzip(e.to_string()))?;
        Ok(if packed.len() < method.body.len() { packed } else { method.body.clone() })
    }

    fn collect_acks(&mut self) -> MsgsAck {
        let count = self.acks.len().min(MAX_IDS);
        MsgsAck { msg_ids: self.acks.drain(..count).collect() }
    }

    /// Ids of sent messages that have waited long enough to ask about.
    fn stale_ids(&self, now: Instant) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .requests
            .iter()
            .filter(|(_, r)| {
                r.created().is_some_and(|c| now.saturating_duration_since(c) >= STATE_REQUEST_DELAY)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.truncate(MAX_IDS);
        ids
    }

    fn seal(&mut self, msg_id: i64, seq_no: i32, body: &[u8], quick_ack: bool) -> Result<(), ProtocolError> {
        let sealed = encrypted::seal(&self.auth, msg_id, seq_no, body)?;
        self.out.push(Outgoing {
            frame:     sealed.frame,
            quick_ack: quick_ack.then_some(sealed.quick_ack),
        });
        Ok(())
    }

    // ─── Writing ─────────────────────────────────────────────────────────────

    /// Encrypt and register one request.
    ///
    /// Pending acknowledgments and a state request for stale messages ride
    /// along in a container whenever the request itself can be
    /// containerized.
    pub fn write(&mut self, request: Request, now: Instant) -> Result<(), ProtocolError> {
        let Some(method) = request.method().cloned() else {
            return Ok(());
        };

        if self.auth.is_unauthorized()
            && matches!(request, Request::Query { .. })
            && !allowed_while_unauthorized(&method)
        {
            tracing::debug!("[{}] delaying {:#010x} until authorized", self.tag, method.constructor_id);
            self.delayed_until_auth.push(request);
            return Ok(());
        }

        if self.auth.auth_key().is_none() {
            self.resend_queue.push_back(request);
            return Err(ProtocolError::NoAuthKey);
        }

        let body = self.pack_body(&method)?;
        let containerizable = can_containerize(&method);

        let msg_id = self.auth.next_message_id();
        let seq_no = self.auth.next_seq_no(method.is_content_related());

        let mut service = Vec::with_capacity(2);
        if containerizable {
            let stale = self.stale_ids(now);
            if !stale.is_empty() {
                service.push(RawMethod::new(&MsgsStateReq { msg_ids: stale }));
            }
            if !self.acks.is_empty() {
                let acks = self.collect_acks();
                service.push(RawMethod::new(&acks));
            }
        }

        if !service.is_empty() {
            let mut messages = Vec::with_capacity(service.len() + 1);
            let mut entries = Vec::with_capacity(service.len() + 1);
            for method in service {
                let id = self.auth.next_message_id();
                let seq = self.auth.next_seq_no(method.is_content_related());
                messages.push(Message { msg_id: id, seq_no: seq, body: method.body.clone() });
                entries.push((id, Request::Rpc { method, created: now }));
            }
            messages.push(Message { msg_id, seq_no, body });
            entries.push((msg_id, request));

            let counted = entries.iter().filter(|(_, r)| r.counts_as_query()).count();
            self.finish_container(messages, entries, now)?;
            self.stats.record_queries(counted);
            return Ok(());
        }

        let quick_ack = self.quick_ack && method.is_content_related();
        self.seal(msg_id, seq_no, &body, quick_ack)?;
        tracing::debug!(
            "[{}] sending {:#010x} as {msg_id:#x}",
            self.tag, method.constructor_id
        );
        if request.counts_as_query() {
            self.stats.record_queries(1);
        }
        self.requests.insert(msg_id, request.into_standalone(now));
        Ok(())
    }

    /// Seal `messages` into a container and register each entry under it.
    fn finish_container(
        &mut self,
        messages: Vec<Message>,
        entries:  Vec<(i64, Request)>,
        now:      Instant,
    ) -> Result<(), ProtocolError> {
        let container_msg_id = self.auth.next_message_id();
        let container_seq_no = self.auth.next_seq_no(false);
        let body = MessageContainer { messages: RawVec(messages) }.to_bytes();
        self.seal(container_msg_id, container_seq_no, &body, false)?;

        let msg_ids: Vec<i64> = entries.iter().map(|(id, _)| *id).collect();
        let pending = entries.iter().filter(|(_, r)| r.expects_result()).count();
        tracing::debug!(
            "[{}] sending container {container_msg_id:#x} with {} messages",
            self.tag, msg_ids.len()
        );
        for (id, request) in entries {
            self.requests.insert(id, request.into_containerized(container_msg_id, now));
        }
        if pending > 0 {
            self.requests.insert(container_msg_id, Request::Container { msg_ids, pending });
        }
        Ok(())
    }

    /// Pack as much of the resend queue as fits into one container.
    fn write_container(&mut self, now: Instant) -> Result<(), ProtocolError> {
        let mut total = 0usize;
        let mut kept = VecDeque::new();
        let mut messages = Vec::new();
        let mut entries = Vec::new();

        while let Some(request) = self.resend_queue.pop_front() {
            if messages.len() == MAX_CONTAINER_MESSAGES {
                kept.push_back(request);
                continue;
            }
            let Some(method) = request.method() else { continue };
            let body = self.pack_body(method)?;
            if total + body.len() >= MAX_CONTAINER_LEN {
                kept.push_back(request);
                continue;
            }
            total += body.len();
            let msg_id = self.auth.next_message_id();
            let seq_no = self.auth.next_seq_no(method.is_content_related());
            messages.push(Message { msg_id, seq_no, body });
            entries.push((msg_id, request));
        }
        self.resend_queue = kept;

        if messages.is_empty() {
            return Ok(());
        }
        let counted = entries.iter().filter(|(_, r)| r.counts_as_query()).count();
        self.finish_container(messages, entries, now)?;
        self.stats.record_queries(counted);
        Ok(())
    }

    // ─── Resending ───────────────────────────────────────────────────────────

    /// Flush the resend queue.
    ///
    /// A single request takes the normal path. Requests that cannot be
    /// containerized go alone; the rest are packed into as few containers
    /// as the size limits allow.
    pub fn resend(&mut self, now: Instant) -> Result<(), ProtocolError> {
        if self.resend_queue.len() == 1 {
            if let Some(request) = self.resend_queue.pop_front() {
                return self.write(request, now);
            }
        }

        let queue = std::mem::take(&mut self.resend_queue);
        let mut alone = Vec::new();
        for request in queue {
            let Some(method) = request.method() else { continue };
            if self.auth.is_unauthorized()
                && matches!(request, Request::Query { .. })
                && !allowed_while_unauthorized(method)
            {
                self.delayed_until_auth.push(request);
            } else if can_containerize(method) {
                self.resend_queue.push_back(request);
            } else {
                alone.push(request);
            }
        }

        for request in alone {
            self.write(request, now)?;
        }
        while !self.resend_queue.is_empty() {
            self.write_container(now)?;
        }
        Ok(())
    }

    /// Resend after a short delay so that a burst of notifications ends up
    /// in one container. A second call while the timer runs flushes at once.
    pub fn delay_resend(&mut self, now: Instant) -> Result<(), ProtocolError> {
        if self.resend_at.take().is_some() {
            return self.resend(now);
        }
        self.resend_at = Some(now + RESEND_DELAY);
        Ok(())
    }

    /// Called by the connection when the resend timer expires.
    pub fn fire_resend(&mut self, now: Instant) -> Result<(), ProtocolError> {
        self.resend_at = None;
        self.resend(now)
    }

    /// Put a request that left the table back into circulation.
    pub(crate) fn requeue(&mut self, request: Request, now: Instant) {
        if request.counts_as_query() {
            self.stats.query_finished();
        }
        let Some(method) = request.method() else { return };
        match method.constructor_id {
            MsgsAck::CONSTRUCTOR_ID => match MsgsAck::from_bytes(&method.body) {
                Ok(acks) => self.acks.extend(acks.msg_ids),
                Err(e) => tracing::warn!("[{}] dropping undecodable acks: {e}", self.tag),
            },
            MsgsStateReq::CONSTRUCTOR_ID => {}
            _ => self.resend_queue.push_back(request.into_standalone(now)),
        }
    }

    // ─── Ping ────────────────────────────────────────────────────────────────

    pub fn ping_in_flight(&self) -> bool { self.keepalive.is_some() }

    /// Send the keepalive `ping_delay_disconnect`. Only its own pong
    /// clears [`Sender::ping_in_flight`].
    pub fn send_ping(&mut self, ping_id: i64, now: Instant) -> Result<(), ProtocolError> {
        self.keepalive = Some(ping_id);
        let ping = PingDelayDisconnect { ping_id, disconnect_delay: PING_DISCONNECT_DELAY };
        self.write(Request::rpc(RawMethod::new(&ping)), now)
    }

    // ─── Bookkeeping ─────────────────────────────────────────────────────────

    pub(crate) fn queue_ack(&mut self, msg_id: i64) {
        self.acks.push(msg_id);
    }

    /// Bookkeeping for an entry that just left the table.
    pub(crate) fn settle(&mut self, request: &Request) {
        if request.counts_as_query() {
            self.stats.query_finished();
        }
        self.release_container(request);
    }

    /// One fewer member of `request`'s container is waiting for an answer.
    pub(crate) fn release_container(&mut self, request: &Request) {
        let Request::Containerized { container_msg_id, .. } = request else { return };
        if !request.expects_result() {
            return;
        }
        let done = match self.requests.get_mut(container_msg_id) {
            Some(Request::Container { pending, .. }) => {
                *pending = pending.saturating_sub(1);
                *pending == 0
            }
            _ => false,
        };
        if done {
            self.requests.remove(container_msg_id);
        }
    }

    /// Fail everything that was sent on the socket being torn down.
    ///
    /// Requests still queued for (re)sending survive and go out after the
    /// next connect.
    pub fn cancel_in_flight(&mut self) {
        for (_, request) in self.requests.drain() {
            request.fail(InvocationError::Cancelled);
        }
        self.acks.clear();
        self.resend_at = None;
        self.keepalive = None;
        self.stats.reset_queries();
    }

    /// Fail every request the connection knows about.
    pub fn cancel_all(&mut self) {
        self.cancel_in_flight();
        for request in self.resend_queue.drain(..) {
            request.fail(InvocationError::Cancelled);
        }
        for request in self.delayed_until_auth.drain(..) {
            request.fail(InvocationError::Cancelled);
        }
        self.out.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use telecore_crypto::{AuthKey, Side};
    use telecore_mtproto::encrypted::open_envelope;
    use telecore_tl::mtproto::GzipPacked;
    use tokio::sync::oneshot;

    pub(crate) fn key() -> AuthKey {
        let mut bytes = [0u8; 256];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        AuthKey::from_bytes(bytes)
    }

    pub(crate) fn sender() -> Sender {
        let config = Config { gzip_threshold: usize::MAX, ..Config::default() };
        let auth = AuthData::new(Some(key()), 64);
        Sender::new("C:test".into(), auth, &config, Arc::new(Stats::new()))
    }

    /// Decrypt every queued frame and return (msg_id, body) pairs.
    pub(crate) fn drain(sender: &mut Sender) -> Vec<(i64, Vec<u8>)> {
        sender
            .out
            .drain(..)
            .map(|mut out| {
                let msg = open_envelope(&key(), Side::Client, &mut out.frame).unwrap();
                (msg.msg_id, msg.body)
            })
            .collect()
    }

    fn id_of(body: &[u8]) -> u32 {
        u32::from_le_bytes(body[..4].try_into().unwrap())
    }

    pub(crate) fn query(body_len: usize) -> (Request, oneshot::Receiver<Result<Vec<u8>, InvocationError>>) {
        let mut body = 0x1234_5678u32.to_le_bytes().to_vec();
        body.resize(body_len, 0);
        let (tx, rx) = oneshot::channel();
        (Request::query(RawMethod::from_body(body), tx), rx)
    }

    #[test]
    fn large_request_is_never_containerized() {
        let mut sender = sender();
        sender.queue_ack(5);
        let (request, _rx) = query(MAX_CONTAINER_LEN);

        sender.write(request, Instant::now()).unwrap();
        let frames = drain(&mut sender);
        assert_eq!(frames.len(), 1);
        assert_eq!(id_of(&frames[0].1), 0x1234_5678);
        assert_eq!(sender.acks, vec![5]);
    }

    #[test]
    fn small_request_with_pending_ack_is_containerized() {
        let mut sender = sender();
        sender.queue_ack(5);
        let (request, _rx) = query(64);

        sender.write(request, Instant::now()).unwrap();
        let frames = drain(&mut sender);
        assert_eq!(frames.len(), 1);
        let (container_id, body) = &frames[0];
        let container = MessageContainer::from_bytes(body).unwrap();
        let inner = container.messages.0;
        assert_eq!(inner.len(), 2);
        assert_eq!(MsgsAck::from_bytes(&inner[0].body).unwrap().msg_ids, vec![5]);
        assert_eq!(id_of(&inner[1].body), 0x1234_5678);
        assert!(inner.iter().all(|m| m.msg_id < *container_id));
        assert!(sender.acks.is_empty());

        // only the query expects an answer
        match sender.requests.get(container_id) {
            Some(Request::Container { pending, msg_ids }) => {
                assert_eq!(*pending, 1);
                assert_eq!(msg_ids.len(), 2);
            }
            other => panic!("container not registered: {other:?}"),
        }
    }

    #[test]
    fn lone_request_goes_standalone() {
        let mut sender = sender();
        let (request, _rx) = query(64);
        sender.write(request, Instant::now()).unwrap();
        let frames = drain(&mut sender);
        assert_eq!(id_of(&frames[0].1), 0x1234_5678);
        assert!(matches!(sender.requests.get(&frames[0].0), Some(Request::Query { .. })));
        assert_eq!(sender.stats.queries(), 1);
    }

    #[test]
    fn stale_messages_are_asked_about() {
        let mut sender = sender();
        let t0 = Instant::now();
        let (first, _rx1) = query(8);
        sender.write(first, t0).unwrap();
        let first_id = drain(&mut sender)[0].0;

        let (second, _rx2) = query(8);
        sender.write(second, t0 + Duration::from_millis(350)).unwrap();
        let frames = drain(&mut sender);
        let inner = MessageContainer::from_bytes(&frames[0].1).unwrap().messages.0;
        assert_eq!(MsgsStateReq::from_bytes(&inner[0].body).unwrap().msg_ids, vec![first_id]);
    }

    #[test]
    fn invoke_with_layer_goes_alone_and_bypasses_auth_delay() {
        let mut sender = sender();
        sender.auth.set_unauthorized(true);
        sender.queue_ack(9);
        let (tx, _rx) = oneshot::channel();
        let method = Config::default().init_request().unwrap();
        sender.write(Request::query(method, tx), Instant::now()).unwrap();

        let frames = drain(&mut sender);
        assert_eq!(id_of(&frames[0].1), schema::INVOKE_WITH_LAYER);
        assert!(sender.delayed_until_auth.is_empty());
    }

    #[test]
    fn unauthorized_queries_wait() {
        let mut sender = sender();
        sender.auth.set_unauthorized(true);
        let (request, _rx) = query(8);
        sender.write(request, Instant::now()).unwrap();
        assert!(sender.out.is_empty());
        assert_eq!(sender.delayed_until_auth.len(), 1);
    }

    #[test]
    fn resend_batches_into_one_container() {
        let mut sender = sender();
        let now = Instant::now();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (request, rx) = query(16);
            sender.resend_queue.push_back(request);
            receivers.push(rx);
        }
        let (big, _rx) = query(MAX_CONTAINER_LEN + 4);
        sender.resend_queue.push_back(big);

        sender.resend(now).unwrap();
        let frames = drain(&mut sender);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1.len(), MAX_CONTAINER_LEN + 4);
        let inner = MessageContainer::from_bytes(&frames[1].1).unwrap().messages.0;
        assert_eq!(inner.len(), 3);
        assert!(sender.resend_queue.is_empty());
    }

    #[test]
    fn gzip_applies_above_threshold() {
        let config = Config { gzip_threshold: 1024, ..Config::default() };
        let mut sender = Sender::new("C:gz".into(), AuthData::new(Some(key()), 64), &config, Arc::new(Stats::new()));
        let (request, _rx) = query(4096);
        sender.write(request, Instant::now()).unwrap();
        let frames = drain(&mut sender);
        assert_eq!(id_of(&frames[0].1), GzipPacked::CONSTRUCTOR_ID);
    }

    #[test]
    fn delay_resend_twice_flushes() {
        let mut sender = sender();
        let now = Instant::now();
        let (request, _rx) = query(8);
        sender.resend_queue.push_back(request);

        sender.delay_resend(now).unwrap();
        assert_eq!(sender.resend_at, Some(now + RESEND_DELAY));
        assert!(sender.out.is_empty());

        sender.delay_resend(now).unwrap();
        assert_eq!(sender.resend_at, None);
        assert_eq!(drain(&mut sender).len(), 1);
    }

    #[test]
    fn piggybacked_service_messages_are_not_queries() {
        let mut sender = sender();
        let t0 = Instant::now();
        sender.queue_ack(5);
        let (request, _rx) = query(64);
        sender.write(request, t0).unwrap();
        assert_eq!(sender.stats.queries(), 1);

        // the next write carries a state request for the first query
        sender.queue_ack(6);
        let (request, _rx2) = query(64);
        sender.write(request, t0 + Duration::from_millis(400)).unwrap();
        assert_eq!(drain(&mut sender).len(), 2);
        assert_eq!(sender.stats.queries(), 2);

        sender.send_ping(1, t0).unwrap();
        sender.write(Request::rpc(RawMethod::new(&MsgsAck { msg_ids: vec![7] })), t0).unwrap();
        assert_eq!(sender.stats.queries(), 2);
    }

    #[tokio::test]
    async fn requeued_query_stops_counting_until_resent() {
        let mut sender = sender();
        let now = Instant::now();
        sender.queue_ack(5);
        let (request, rx) = query(64);
        sender.write(request, now).unwrap();
        let inner = MessageContainer::from_bytes(&drain(&mut sender)[0].1).unwrap().messages.0;

        let (ack_id, query_id) = (inner[0].msg_id, inner[1].msg_id);
        let ack = sender.requests.remove(&ack_id).unwrap();
        sender.requeue(ack, now);
        assert_eq!(sender.stats.queries(), 1);
        assert_eq!(sender.acks, vec![5]);

        let query = sender.requests.remove(&query_id).unwrap();
        sender.requeue(query, now);
        assert_eq!(sender.stats.queries(), 0);

        sender.resend(now).unwrap();
        assert_eq!(sender.stats.queries(), 1);
        drop(rx);
    }

    #[tokio::test]
    async fn cancel_in_flight_keeps_queued_requests() {
        let mut sender = sender();
        let (sent, sent_rx) = query(8);
        sender.write(sent, Instant::now()).unwrap();
        let (queued, _queued_rx) = query(8);
        sender.resend_queue.push_back(queued);

        sender.cancel_in_flight();
        assert_eq!(sent_rx.await.unwrap(), Err(InvocationError::Cancelled));
        assert_eq!(sender.resend_queue.len(), 1);
        assert_eq!(sender.stats.queries(), 0);
    }
}
