//! In-process MTProto server speaking Abridged over loopback.
//!
//! It generates an auth key with the client (or picks up a key it generated
//! earlier when the client reconnects), then decrypts everything the client
//! sends, walks containers, answers pings, `destroy_session` and the
//! session's `invokeWithLayer`, and hands every other content message to a
//! per-test [`Handler`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use num_bigint::BigUint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use telecore_client::{Config, DataCenter, DcKind};
use telecore_crypto::rsa::{Key, PublicKeyRegistry};
use telecore_crypto::{AuthKey, Side, aes, fill_random, generate_key_data_from_nonce, sha1};
use telecore_mtproto::dh_prime::builtin_prime;
use telecore_mtproto::encrypted::{open_envelope, seal_envelope};
use telecore_mtproto::plain::PlainMessage;
use telecore_mtproto::{Abridged, Transport};
use telecore_tl::mtproto::{
    ClientDhInnerData, DestroySession, DestroySessionOk, DhGenOk, Message, MessageContainer, MsgsAck, MsgsStateReq, PQInnerDataDc, PingDelayDisconnect,
    Pong, ReqDhParams, ReqPqMulti, ResPq, RpcError, RpcResult, ServerDhInnerData, ServerDhParams, ServerDhParamsOk,
    SetClientDhParams, SetClientDhParamsAnswer,
};
use telecore_tl::{Blob, Cursor, Deserializable, Identifiable, Serializable, schema};

const TEST_N: &str = "20183058666687540328608524367062671558697411132734358940959795722023622496805842242782875980509242085016851350029890189890909699780614332254631110861375436879682879981565730153019445928024899419607140543783911039614199857293465756301229970533611923931651918650563711116987497199494112171132629212721866300361705850716597965228634003521099418137291214364447912567311520160987314125866698597504459367179359744176306982566421746336193744087913839031258978781628406533759829829366542847732975864000085380874122287154254487030005352013491987146943831229279073856711160253916595332443176995788627598122509772786780010972199";
const TEST_D: &str = "11545274979865559903248622457494430536399396462381225602905866637516877241600229181068514543438225376889340986942804115672373067657589616581379460687582644203769343845902584154089232164971320846875079601536766116302191715368032374658235963888102559108193826056898896288581172200616976229970720914227536288421034335363303291816852217684826296784251937203718334335195253886346626830571478973237194751322945565512929892915449219910678094347688693321864497779592598638856231420925397126554903854416856654405777699843823176103752866660942209303327736381917954678475507678227564656297423347031840934808306296035596747292033";

/// 1206429347 * 1218991343
const PQ: u64 = 1470626929934143021;

/// Constructor id of the dummy `config` the server answers init with.
pub const CONFIG_ID: u32 = 0xcc1a241e;

/// What the server does with a content message it does not handle itself.
pub enum Reply {
    Result(Vec<u8>),
    Error(i32, &'static str),
    Ignore,
    /// Close the socket without answering.
    Disconnect,
    /// Send this 4-byte transport error, forget the auth key and close.
    TransportError(i32),
}

pub type Handler = Arc<dyn Fn(u32, &[u8]) -> Reply + Send + Sync>;

fn unix_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

// ─── Handshake ────────────────────────────────────────────────────────────────

struct KeyExchange {
    n: BigUint,
    d: BigUint,
    fingerprint: i64,
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    a: BigUint,
}

impl KeyExchange {
    fn new() -> Self {
        let mut server_nonce = [0u8; 16];
        fill_random(&mut server_nonce);
        let mut a = [0u8; 256];
        fill_random(&mut a);
        Self {
            n: BigUint::parse_bytes(TEST_N.as_bytes(), 10).unwrap(),
            d: BigUint::parse_bytes(TEST_D.as_bytes(), 10).unwrap(),
            fingerprint: test_key().fingerprint(),
            server_nonce,
            new_nonce: [0; 32],
            a: BigUint::from_bytes_be(&a),
        }
    }

    fn prime() -> BigUint {
        BigUint::from_bytes_be(&builtin_prime())
    }

    fn res_pq(&self, req: &ReqPqMulti) -> ResPq {
        ResPq {
            nonce: req.nonce,
            server_nonce: self.server_nonce,
            pq: PQ.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![self.fingerprint],
        }
    }

    fn server_dh_params(&mut self, req: &ReqDhParams) -> ServerDhParams {
        let block = BigUint::from_bytes_be(&req.encrypted_data).modpow(&self.d, &self.n).to_bytes_be();
        let mut padded = vec![0u8; 255 - block.len()];
        padded.extend_from_slice(&block);
        let inner = PQInnerDataDc::from_bytes(&padded[20..]).unwrap();
        self.new_nonce = inner.new_nonce;

        let answer = ServerDhInnerData {
            nonce: req.nonce,
            server_nonce: self.server_nonce,
            g: 3,
            dh_prime: Self::prime().to_bytes_be(),
            g_a: BigUint::from(3u32).modpow(&self.a, &Self::prime()).to_bytes_be(),
            server_time: unix_secs() as i32,
        }
        .to_bytes();

        let mut hashed = sha1!(&answer).to_vec();
        hashed.extend_from_slice(&answer);
        while hashed.len() % 16 != 0 {
            hashed.push(0);
        }
        let (key, iv) = generate_key_data_from_nonce(&self.server_nonce, &self.new_nonce);
        aes::ige_encrypt(&mut hashed, &key, &iv);

        ServerDhParams::Ok(ServerDhParamsOk {
            nonce: req.nonce,
            server_nonce: self.server_nonce,
            encrypted_answer: hashed,
        })
    }

    fn dh_gen(&self, req: &SetClientDhParams) -> (SetClientDhParamsAnswer, AuthKey) {
        let mut data = req.encrypted_data.clone();
        let (key, iv) = generate_key_data_from_nonce(&self.server_nonce, &self.new_nonce);
        aes::ige_decrypt(&mut data, &key, &iv);
        let inner = ClientDhInnerData::deserialize(&mut Cursor::from_slice(&data[20..])).unwrap();

        let gab = BigUint::from_bytes_be(&inner.g_b).modpow(&self.a, &Self::prime()).to_bytes_be();
        let mut key_bytes = [0u8; 256];
        key_bytes[256 - gab.len()..].copy_from_slice(&gab);
        let auth_key = AuthKey::from_bytes(key_bytes);

        let answer = SetClientDhParamsAnswer::Ok(DhGenOk {
            nonce: req.nonce,
            server_nonce: self.server_nonce,
            new_nonce_hash1: auth_key.calc_new_nonce_hash(&self.new_nonce, 1),
        });
        (answer, auth_key)
    }
}

pub fn test_key() -> Key {
    Key::new(TEST_N, "65537").unwrap()
}

// ─── Server ───────────────────────────────────────────────────────────────────

struct State {
    handler:      Handler,
    /// Constructor ids of every content message received, in order.
    seen:         Mutex<Vec<u32>>,
    keys:         Mutex<HashMap<i64, AuthKey>>,
    /// Client session ids, in order of first appearance.
    sessions:     Mutex<Vec<i64>>,
    /// Session ids named by `destroy_session`.
    destroyed:    Mutex<Vec<i64>>,
    handshakes:   AtomicUsize,
    connections:  AtomicUsize,
    answer_pings: AtomicBool,
}

/// Handle to a running fake server.
pub struct FakeServer {
    pub port: u16,
    state:    Arc<State>,
}

impl FakeServer {
    pub async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State {
            handler,
            seen: Mutex::new(Vec::new()),
            keys: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            handshakes: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            answer_pings: AtomicBool::new(true),
        });
        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });
        Self { port, state }
    }

    pub fn dc(&self) -> DataCenter {
        DataCenter::new(DcKind::Regular, 2, "127.0.0.1", self.port, true)
    }

    /// A client configuration that trusts this server's key.
    pub fn config(&self) -> Config {
        let mut keys = PublicKeyRegistry::empty();
        keys.insert(test_key());
        // key generation runs unoptimized in tests
        Config {
            keys: Arc::new(keys),
            handshake_step_timeout: Duration::from_secs(30),
            ..Config::with_api_id(1)
        }
    }

    pub fn seen(&self) -> Vec<u32> {
        self.state.seen.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> Vec<i64> {
        self.state.sessions.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<i64> {
        self.state.destroyed.lock().unwrap().clone()
    }

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Stop (or resume) answering keepalive pings.
    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }
}

struct Conn {
    stream: TcpStream,
    codec: Abridged,
    buffer: Vec<u8>,
    next_id: AtomicI64,
}

impl Conn {
    async fn read(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer).unwrap() {
                return Some(frame);
            }
            if self.stream.read_buf(&mut self.buffer).await.ok()? == 0 {
                return None;
            }
        }
    }

    async fn write(&mut self, payload: &[u8]) {
        let mut wire = Vec::new();
        self.codec.encode(payload, false, &mut wire);
        let _ = self.stream.write_all(&wire).await;
    }

    /// Odd, increasing server message ids in the current second.
    fn msg_id(&self) -> i64 {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        (unix_secs() << 32) | (n * 4 + 1)
    }

    async fn plain<T: Deserializable>(&mut self) -> Option<T> {
        let frame = self.read().await?;
        Some(parse_plain(&frame))
    }

    async fn send_plain(&mut self, body: &impl Serializable) {
        let message = PlainMessage::new(self.msg_id(), body.to_bytes());
        self.write(&message.to_bytes()).await;
    }
}

fn parse_plain<T: Deserializable>(frame: &[u8]) -> T {
    T::from_bytes(&PlainMessage::from_frame(frame).unwrap().body).unwrap()
}

/// What to do after a decrypted client message.
enum Action {
    Send(Vec<u8>),
    Close,
    Fail(i32),
}

async fn serve(stream: TcpStream, state: Arc<State>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut conn = Conn { stream, codec: Abridged, buffer: Vec::new(), next_id: AtomicI64::new(0) };

    let mut tag = [0u8; 1];
    if conn.stream.read_exact(&mut tag).await.is_err() || tag[0] != 0xef {
        return;
    }
    let Some(first) = conn.read().await else { return };

    let key_id = i64::from_le_bytes(first[..8].try_into().unwrap());
    let mut next = None;
    let key = if key_id == 0 {
        let Some(key) = handshake(&mut conn, parse_plain(&first)).await else { return };
        state.handshakes.fetch_add(1, Ordering::SeqCst);
        state.keys.lock().unwrap().insert(key.id(), key.clone());
        key
    } else {
        let known = state.keys.lock().unwrap().get(&key_id).cloned();
        let Some(key) = known else {
            conn.write(&(-404i32).to_le_bytes()).await;
            return;
        };
        next = Some(first);
        key
    };

    let mut seq_no = 0;
    loop {
        let frame = match next.take() {
            Some(frame) => frame,
            None => match conn.read().await {
                Some(frame) => frame,
                None => return,
            },
        };
        if !answer(&mut conn, &state, &key, &mut seq_no, frame).await {
            return;
        }
    }
}

async fn handshake(conn: &mut Conn, req: ReqPqMulti) -> Option<AuthKey> {
    let mut exchange = KeyExchange::new();
    conn.send_plain(&exchange.res_pq(&req)).await;
    let req = conn.plain::<ReqDhParams>().await?;
    let params = exchange.server_dh_params(&req);
    conn.send_plain(&params).await;
    let req = conn.plain::<SetClientDhParams>().await?;
    let (answer, key) = exchange.dh_gen(&req);
    conn.send_plain(&answer).await;
    Some(key)
}

/// Handle one encrypted frame. `false` means the socket should close.
async fn answer(conn: &mut Conn, state: &State, key: &AuthKey, seq_no: &mut i32, mut frame: Vec<u8>) -> bool {
    let Ok(message) = open_envelope(key, Side::Client, &mut frame) else { return false };
    {
        let mut sessions = state.sessions.lock().unwrap();
        if !sessions.contains(&message.session_id) {
            sessions.push(message.session_id);
        }
    }

    let mut actions = Vec::new();
    collect(message.msg_id, &message.body, state, &mut actions);
    for action in actions {
        match action {
            Action::Send(reply) => {
                *seq_no += 2;
                let sealed = seal_envelope(
                    key,
                    Side::Server,
                    message.salt,
                    message.session_id,
                    conn.msg_id(),
                    *seq_no + 1,
                    &reply,
                );
                conn.write(&sealed.frame).await;
            }
            Action::Close => return false,
            Action::Fail(code) => {
                state.keys.lock().unwrap().remove(&key.id());
                conn.write(&code.to_le_bytes()).await;
                return false;
            }
        }
    }
    true
}

fn collect(msg_id: i64, body: &[u8], state: &State, actions: &mut Vec<Action>) {
    let id = Cursor::from_slice(body).peek_id().unwrap();
    let result = |bytes: Vec<u8>| Action::Send(RpcResult { req_msg_id: msg_id, result: Blob(bytes) }.to_bytes());

    match id {
        MessageContainer::CONSTRUCTOR_ID => {
            let container = MessageContainer::from_bytes(body).unwrap();
            for Message { msg_id, body, .. } in container.messages.0 {
                collect(msg_id, &body, state, actions);
            }
        }
        MsgsAck::CONSTRUCTOR_ID | MsgsStateReq::CONSTRUCTOR_ID => {}
        PingDelayDisconnect::CONSTRUCTOR_ID => {
            if state.answer_pings.load(Ordering::SeqCst) {
                let ping = PingDelayDisconnect::from_bytes(body).unwrap();
                actions.push(Action::Send(Pong { msg_id, ping_id: ping.ping_id }.to_bytes()));
            }
        }
        DestroySession::CONSTRUCTOR_ID => {
            let destroy = DestroySession::from_bytes(body).unwrap();
            state.seen.lock().unwrap().push(id);
            state.destroyed.lock().unwrap().push(destroy.session_id);
            actions.push(Action::Send(DestroySessionOk { session_id: destroy.session_id }.to_bytes()));
        }
        schema::INVOKE_WITH_LAYER => {
            state.seen.lock().unwrap().push(id);
            actions.push(result(CONFIG_ID.to_le_bytes().to_vec()));
        }
        _ => {
            state.seen.lock().unwrap().push(id);
            match (state.handler)(id, body) {
                Reply::Result(bytes) => actions.push(result(bytes)),
                Reply::Error(code, message) => {
                    let error = RpcError { error_code: code, error_message: message.into() };
                    actions.push(result(error.to_bytes()));
                }
                Reply::Ignore => {}
                Reply::Disconnect => actions.push(Action::Close),
                Reply::TransportError(code) => actions.push(Action::Fail(code)),
            }
        }
    }
}
