//! Classification of decrypted message bodies.
//!
//! [`parse`] looks at the constructor id of a body, unwraps `gzip_packed`
//! wherever the server may use it, and returns a typed [`ServiceMessage`].
//! Acting on it (acks, resends, salt changes) is left to the connection.

use std::fmt;

use telecore_tl::mtproto::{
    BadMsgNotification, BadServerSalt, DestroySessionNone, DestroySessionOk, DestroySessionRes,
    GzipPacked, Message, MessageContainer, MsgDetailedInfo, MsgNewDetailedInfo, MsgResendReq,
    MsgsAck, MsgsAllInfo, MsgsStateInfo, NewSessionCreated, Pong, RpcError, RpcResult,
};
use telecore_tl::{Cursor, Deserializable, Identifiable, schema};

use crate::gzip;

// ─── Error ───────────────────────────────────────────────────────────────────

/// A body could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    Deserialize(telecore_tl::deserialize::Error),
    /// `gzip_packed` payload failed to inflate.
    Inflate(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deserialize(e) => write!(f, "deserialize: {e}"),
            Self::Inflate(e) => write!(f, "inflate: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<telecore_tl::deserialize::Error> for DecodeError {
    fn from(e: telecore_tl::deserialize::Error) -> Self { Self::Deserialize(e) }
}

// ─── ServiceMessage ──────────────────────────────────────────────────────────

/// The `result` of an `rpc_result`, already inflated.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcAnswer {
    Ok(Vec<u8>),
    Err(RpcError),
}

/// A decoded inbound body.
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceMessage {
    RpcResult { req_msg_id: i64, answer: RpcAnswer },
    Container(Vec<Message>),
    Pong(Pong),
    NewSessionCreated(NewSessionCreated),
    MsgsAck(MsgsAck),
    BadMsgNotification(BadMsgNotification),
    BadServerSalt(BadServerSalt),
    MsgsStateInfo(MsgsStateInfo),
    MsgsAllInfo(MsgsAllInfo),
    MsgDetailedInfo(MsgDetailedInfo),
    MsgNewDetailedInfo(MsgNewDetailedInfo),
    MsgResendReq(MsgResendReq),
    DestroySession(DestroySessionRes),
    /// A constructor of the boxed `Updates` type, kept serialized.
    Updates(Vec<u8>),
    /// Anything else; the connection logs and drops it.
    Unknown { constructor_id: u32, body: Vec<u8> },
}

/// Constructor id at the start of `body`.
pub fn constructor_id(body: &[u8]) -> Result<u32, DecodeError> {
    Ok(Cursor::from_slice(body).peek_id()?)
}

/// Inflate `body` if it is a `gzip_packed`, otherwise return it unchanged.
pub fn unpack(body: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if constructor_id(body)? != GzipPacked::CONSTRUCTOR_ID {
        return Ok(body.to_vec());
    }
    let packed = GzipPacked::from_bytes(body)?;
    gzip::inflate(&packed.packed_data).map_err(|e| DecodeError::Inflate(e.to_string()))
}

/// Decode one message body.
pub fn parse(body: &[u8]) -> Result<ServiceMessage, DecodeError> {
    let id = constructor_id(body)?;
    let message = match id {
        GzipPacked::CONSTRUCTOR_ID => return parse(&unpack(body)?),
        RpcResult::CONSTRUCTOR_ID => {
            let RpcResult { req_msg_id, result } = RpcResult::from_bytes(body)?;
            let result = unpack(&result.0)?;
            let answer = if constructor_id(&result)? == RpcError::CONSTRUCTOR_ID {
                RpcAnswer::Err(RpcError::from_bytes(&result)?)
            } else {
                RpcAnswer::Ok(result)
            };
            ServiceMessage::RpcResult { req_msg_id, answer }
        }
        MessageContainer::CONSTRUCTOR_ID => {
            ServiceMessage::Container(MessageContainer::from_bytes(body)?.messages.0)
        }
        Pong::CONSTRUCTOR_ID => ServiceMessage::Pong(Pong::from_bytes(body)?),
        NewSessionCreated::CONSTRUCTOR_ID => {
            ServiceMessage::NewSessionCreated(NewSessionCreated::from_bytes(body)?)
        }
        MsgsAck::CONSTRUCTOR_ID => ServiceMessage::MsgsAck(MsgsAck::from_bytes(body)?),
        BadMsgNotification::CONSTRUCTOR_ID => {
            ServiceMessage::BadMsgNotification(BadMsgNotification::from_bytes(body)?)
        }
        BadServerSalt::CONSTRUCTOR_ID => {
            ServiceMessage::BadServerSalt(BadServerSalt::from_bytes(body)?)
        }
        MsgsStateInfo::CONSTRUCTOR_ID => {
            ServiceMessage::MsgsStateInfo(MsgsStateInfo::from_bytes(body)?)
        }
        MsgsAllInfo::CONSTRUCTOR_ID => ServiceMessage::MsgsAllInfo(MsgsAllInfo::from_bytes(body)?),
        MsgDetailedInfo::CONSTRUCTOR_ID => {
            ServiceMessage::MsgDetailedInfo(MsgDetailedInfo::from_bytes(body)?)
        }
        MsgNewDetailedInfo::CONSTRUCTOR_ID => {
            ServiceMessage::MsgNewDetailedInfo(MsgNewDetailedInfo::from_bytes(body)?)
        }
        MsgResendReq::CONSTRUCTOR_ID => {
            ServiceMessage::MsgResendReq(MsgResendReq::from_bytes(body)?)
        }
        DestroySessionOk::CONSTRUCTOR_ID | DestroySessionNone::CONSTRUCTOR_ID => {
            ServiceMessage::DestroySession(DestroySessionRes::from_bytes(body)?)
        }
        id if schema::is_updates(id) => ServiceMessage::Updates(body.to_vec()),
        constructor_id => ServiceMessage::Unknown { constructor_id, body: body.to_vec() },
    };
    Ok(message)
}
