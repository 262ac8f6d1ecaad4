//! Outbound requests and their bookkeeping states.

use tokio::sync::oneshot;
use tokio::time::Instant;

use telecore_tl::mtproto::{DestroySession, MsgsAck, MsgsStateReq, Ping, PingDelayDisconnect};
use telecore_tl::{Identifiable, Serializable};

use crate::errors::InvocationError;

// ─── RawMethod ────────────────────────────────────────────────────────────────

/// A serialized method: constructor id plus the full body (id included).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMethod {
    pub constructor_id: u32,
    pub body:           Vec<u8>,
}

impl RawMethod {
    pub fn new<S: Serializable>(method: &S) -> Self {
        Self::from_body(method.to_bytes())
    }

    /// Wrap an already serialized body. Bodies shorter than 4 bytes get
    /// constructor id 0.
    pub fn from_body(body: Vec<u8>) -> Self {
        let constructor_id = body
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .unwrap_or_default();
        Self { constructor_id, body }
    }

    /// Whether the server answers this method at all.
    pub fn expects_result(&self) -> bool {
        !matches!(self.constructor_id, MsgsAck::CONSTRUCTOR_ID | DestroySession::CONSTRUCTOR_ID)
    }

    pub fn is_ping(&self) -> bool {
        matches!(self.constructor_id, Ping::CONSTRUCTOR_ID | PingDelayDisconnect::CONSTRUCTOR_ID)
    }

    /// Content-related messages take an odd seqno and must be acknowledged.
    pub fn is_content_related(&self) -> bool {
        !matches!(self.constructor_id, MsgsAck::CONSTRUCTOR_ID | MsgsStateReq::CONSTRUCTOR_ID)
    }
}

/// Where the answer to a query goes.
pub type ResultSink = oneshot::Sender<Result<Vec<u8>, InvocationError>>;

// ─── Request ──────────────────────────────────────────────────────────────────

/// Everything the connection tracks by outbound message id.
#[derive(Debug)]
pub enum Request {
    /// Fire-and-forget: acks, state requests, pings, destroy_session.
    Rpc { method: RawMethod, created: Instant },
    /// A call whose answer someone is waiting for.
    Query { method: RawMethod, sink: ResultSink, created: Instant },
    /// A sent `msg_container`; `pending` counts members still expecting an
    /// answer.
    Container { msg_ids: Vec<i64>, pending: usize },
    /// A message that went out inside container `container_msg_id`.
    Containerized {
        container_msg_id: i64,
        method:           RawMethod,
        sink:             Option<ResultSink>,
        created:          Instant,
    },
}

impl Request {
    pub fn rpc(method: RawMethod) -> Self {
        Self::Rpc { method, created: Instant::now() }
    }

    pub fn query(method: RawMethod, sink: ResultSink) -> Self {
        Self::Query { method, sink, created: Instant::now() }
    }

    pub fn method(&self) -> Option<&RawMethod> {
        match self {
            Self::Rpc { method, .. }
            | Self::Query { method, .. }
            | Self::Containerized { method, .. } => Some(method),
            Self::Container { .. } => None,
        }
    }

    pub fn is_standalone(&self) -> bool {
        matches!(self, Self::Rpc { .. } | Self::Query { .. })
    }

    pub fn created(&self) -> Option<Instant> {
        match self {
            Self::Rpc { created, .. }
            | Self::Query { created, .. }
            | Self::Containerized { created, .. } => Some(*created),
            Self::Container { .. } => None,
        }
    }

    pub fn expects_result(&self) -> bool {
        self.method().is_some_and(RawMethod::expects_result)
    }

    /// A caller is waiting on this entry and it is not a ping. Only these
    /// count towards [`Stats::queries`](crate::Stats::queries).
    pub fn counts_as_query(&self) -> bool {
        let awaited = matches!(self, Self::Query { .. } | Self::Containerized { sink: Some(_), .. });
        awaited && self.method().is_some_and(|m| !m.is_ping())
    }

    /// Re-home a standalone request inside container `container_msg_id`.
    pub fn into_containerized(self, container_msg_id: i64, now: Instant) -> Self {
        match self {
            Self::Rpc { method, .. } => {
                Self::Containerized { container_msg_id, method, sink: None, created: now }
            }
            Self::Query { method, sink, .. } => {
                Self::Containerized { container_msg_id, method, sink: Some(sink), created: now }
            }
            Self::Containerized { method, sink, .. } => {
                Self::Containerized { container_msg_id, method, sink, created: now }
            }
            container @ Self::Container { .. } => container,
        }
    }

    /// Turn a containerized request back into a standalone one.
    pub fn into_standalone(self, now: Instant) -> Self {
        match self {
            Self::Containerized { method, sink: Some(sink), .. } => {
                Self::Query { method, sink, created: now }
            }
            Self::Containerized { method, sink: None, .. } => Self::Rpc { method, created: now },
            Self::Rpc { method, .. } => Self::Rpc { method, created: now },
            Self::Query { method, sink, .. } => Self::Query { method, sink, created: now },
            container @ Self::Container { .. } => container,
        }
    }

    /// Complete with the answer bytes. The receiver may be gone already.
    pub fn resolve(self, answer: Vec<u8>) {
        if let Some(sink) = self.into_sink() {
            let _ = sink.send(Ok(answer));
        }
    }

    pub fn fail(self, error: InvocationError) {
        if let Some(sink) = self.into_sink() {
            let _ = sink.send(Err(error));
        }
    }

    fn into_sink(self) -> Option<ResultSink> {
        match self {
            Self::Query { sink, .. } => Some(sink),
            Self::Containerized { sink, .. } => sink,
            Self::Rpc { .. } | Self::Container { .. } => None,
        }
    }
}
