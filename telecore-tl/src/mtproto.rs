//! Constructors of the MTProto service layer.
//!
//! Covers the authorization-key exchange, the service messages a session
//! exchanges with the server, and the two wrappers (`invokeWithLayer`,
//! `initConnection`) every connection sends before application traffic.

use crate::deserialize::{Buffer, Error, Result};
use crate::{Blob, Deserializable, Identifiable, RawVec, RemoteCall, Serializable};

// ─── Authorization key exchange ──────────────────────────────────────────────

tl_object! {
    /// `req_pq_multi#be7e8ef1 nonce:int128 = ResPQ`
    ReqPqMulti = 0xbe7e8ef1 { nonce: [u8; 16] }
}

tl_object! {
    ResPq = 0x05162463 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        pq: Vec<u8>,
        server_public_key_fingerprints: Vec<i64>,
    }
}

tl_object! {
    PQInnerDataDc = 0xa9f55f95 {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
        dc: i32,
    }
}

tl_object! {
    /// Inner data for a temporary key that expires after `expires_in` seconds.
    PQInnerDataTempDc = 0x56fddf88 {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
        dc: i32,
        expires_in: i32,
    }
}

tl_object! {
    ReqDhParams = 0xd712e4be {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        p: Vec<u8>,
        q: Vec<u8>,
        public_key_fingerprint: i64,
        encrypted_data: Vec<u8>,
    }
}

tl_object! {
    ServerDhParamsOk = 0xd0e8075c {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_answer: Vec<u8>,
    }
}

tl_object! {
    ServerDhParamsFail = 0x79cb045d {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash: [u8; 16],
    }
}

tl_enum! {
    ServerDhParams { Ok(ServerDhParamsOk), Fail(ServerDhParamsFail) }
}

tl_object! {
    ServerDhInnerData = 0xb5890dba {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        g: i32,
        dh_prime: Vec<u8>,
        g_a: Vec<u8>,
        server_time: i32,
    }
}

tl_object! {
    ClientDhInnerData = 0x6643b654 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        retry_id: i64,
        g_b: Vec<u8>,
    }
}

tl_object! {
    SetClientDhParams = 0xf5045f1f {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_data: Vec<u8>,
    }
}

tl_object! {
    DhGenOk = 0x3bcbf734 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash1: [u8; 16],
    }
}

tl_object! {
    DhGenRetry = 0x46dc1fb9 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash2: [u8; 16],
    }
}

tl_object! {
    DhGenFail = 0xa69dae02 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash3: [u8; 16],
    }
}

tl_enum! {
    SetClientDhParamsAnswer { Ok(DhGenOk), Retry(DhGenRetry), Fail(DhGenFail) }
}

impl RemoteCall for ReqPqMulti { type Return = ResPq; }
impl RemoteCall for ReqDhParams { type Return = ServerDhParams; }
impl RemoteCall for SetClientDhParams { type Return = SetClientDhParamsAnswer; }

// ─── Service messages ────────────────────────────────────────────────────────

tl_object! {
    /// `rpc_result#f35c6d01 req_msg_id:long result:Object`
    ///
    /// `result` is left undecoded; it may be `gzip_packed` or `rpc_error`.
    RpcResult = 0xf35c6d01 { req_msg_id: i64, result: Blob }
}

tl_object! {
    RpcError = 0x2144ca19 { error_code: i32, error_message: String }
}

tl_object! {
    MsgsAck = 0x62d6b459 { msg_ids: Vec<i64> }
}

tl_object! {
    BadMsgNotification = 0xa7eff811 {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
    }
}

tl_object! {
    BadServerSalt = 0xedab447b {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
        new_server_salt: i64,
    }
}

tl_object! {
    MsgsStateReq = 0xda69fb52 { msg_ids: Vec<i64> }
}

tl_object! {
    /// One status byte per id of the referenced `msgs_state_req`.
    MsgsStateInfo = 0x04deb57d { req_msg_id: i64, info: Vec<u8> }
}

tl_object! {
    MsgsAllInfo = 0x8cc0d131 { msg_ids: Vec<i64>, info: Vec<u8> }
}

tl_object! {
    MsgDetailedInfo = 0x276d3ec6 {
        msg_id: i64,
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
}

tl_object! {
    MsgNewDetailedInfo = 0x809db6df {
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
}

tl_object! {
    MsgResendReq = 0x7d861a08 { msg_ids: Vec<i64> }
}

tl_object! {
    NewSessionCreated = 0x9ec20908 {
        first_msg_id: i64,
        unique_id: i64,
        server_salt: i64,
    }
}

tl_object! {
    Pong = 0x347773c5 { msg_id: i64, ping_id: i64 }
}

tl_object! {
    Ping = 0x7abe77ec { ping_id: i64 }
}

tl_object! {
    /// Ping that also asks the server to close the socket after
    /// `disconnect_delay` seconds without another one.
    PingDelayDisconnect = 0xf3427b8c { ping_id: i64, disconnect_delay: i32 }
}

tl_object! {
    DestroySession = 0xe7512126 { session_id: i64 }
}

tl_object! {
    DestroySessionOk = 0xe22045fc { session_id: i64 }
}

tl_object! {
    DestroySessionNone = 0x62d350c9 { session_id: i64 }
}

tl_enum! {
    DestroySessionRes { Ok(DestroySessionOk), None(DestroySessionNone) }
}

tl_object! {
    GzipPacked = 0x3072cfa1 { packed_data: Vec<u8> }
}

impl RemoteCall for Ping { type Return = Pong; }
impl RemoteCall for PingDelayDisconnect { type Return = Pong; }
impl RemoteCall for DestroySession { type Return = DestroySessionRes; }

// ─── Containers ──────────────────────────────────────────────────────────────

/// One entry of a `msg_container`: `msg_id:long seqno:int bytes:int body`.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

impl Message {
    /// Size of the fixed header preceding `body`.
    pub const HEADER_LEN: usize = 16;
}

impl Serializable for Message {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.msg_id.serialize(buf);
        self.seq_no.serialize(buf);
        (self.body.len() as i32).serialize(buf);
        buf.extend(self.body.iter().copied());
    }
}

impl Deserializable for Message {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let msg_id = i64::deserialize(buf)?;
        let seq_no = i32::deserialize(buf)?;
        let len = i32::deserialize(buf)?;
        if len < 0 || len % 4 != 0 {
            return Err(Error::InvalidLength { len });
        }
        let body = buf.take(len as usize)?.to_vec();
        Ok(Self { msg_id, seq_no, body })
    }
}

tl_object! {
    MessageContainer = 0x73f1f8dc { messages: RawVec<Message> }
}

impl MessageContainer {
    /// Serialized size of the container header (id + count).
    pub const HEADER_LEN: usize = 8;
}

// ─── Connection wrappers ─────────────────────────────────────────────────────

tl_object! {
    /// `invokeWithLayer#da9b0d0d {X:Type} layer:int query:!X = X`
    InvokeWithLayer = 0xda9b0d0d { layer: i32, query: Blob }
}

impl RemoteCall for InvokeWithLayer { type Return = Blob; }

/// `initConnection#c1cd5ea9`, always sent without a proxy or JSON params.
#[derive(Clone, Debug, PartialEq)]
pub struct InitConnection {
    pub api_id: i32,
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub system_lang_code: String,
    pub lang_pack: String,
    pub lang_code: String,
    pub query: Blob,
}

impl Identifiable for InitConnection {
    const CONSTRUCTOR_ID: u32 = 0xc1cd5ea9;
}

impl Serializable for InitConnection {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        0u32.serialize(buf);
        self.api_id.serialize(buf);
        self.device_model.serialize(buf);
        self.system_version.serialize(buf);
        self.app_version.serialize(buf);
        self.system_lang_code.serialize(buf);
        self.lang_pack.serialize(buf);
        self.lang_code.serialize(buf);
        self.query.serialize(buf);
    }
}

impl RemoteCall for InitConnection { type Return = Blob; }
