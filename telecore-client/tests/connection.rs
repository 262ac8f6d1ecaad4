//! Connections against the in-process fake server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeServer, Reply};
use telecore_client::{Config, Connection, ConnectionState, DcId, FixedInterval, InvocationError, RawMethod, Store};
use telecore_tl::mtproto::DestroySession;
use telecore_tl::{Identifiable, schema};

const ECHO: u32 = 0x1111_1111;
const PROTECTED: u32 = 0x2222_2222;
const LOGOUT: u32 = 0x3333_3333;
const DROP: u32 = 0x4444_4444;
const FORGET: u32 = 0x5555_5555;

fn method(id: u32) -> RawMethod {
    let mut body = id.to_le_bytes().to_vec();
    body.extend([7, 7, 7, 7]);
    RawMethod::from_body(body)
}

async fn server() -> FakeServer {
    FakeServer::start(Arc::new(|id: u32, body: &[u8]| match id {
        ECHO => Reply::Result(body.to_vec()),
        PROTECTED => Reply::Result(vec![0xaa, 0xbb, 0xcc, 0xdd]),
        LOGOUT => Reply::Error(401, "AUTH_KEY_UNREGISTERED"),
        DROP => Reply::Disconnect,
        FORGET => Reply::TransportError(-404),
        schema::AUTH_CHECK_PASSWORD => Reply::Result(schema::AUTH_AUTHORIZATION.to_le_bytes().to_vec()),
        _ => Reply::Ignore,
    }))
    .await
}

async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(60), future).await.expect("timed out")
}

async fn until(mut done: impl FnMut() -> bool) {
    while !done() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn retrying(server: &FakeServer, delay: Duration) -> Config {
    Config {
        reconnection: Arc::new(FixedInterval { delay, max_attempts: 20 }),
        ..server.config()
    }
}

#[tokio::test]
async fn handshake_completes_and_connection_becomes_ready() {
    let server = server().await;
    let config = server.config();
    let store = Arc::clone(&config.store);
    let connection = Connection::connect(Arc::new(config), server.dc(), DcId::Main);

    within(connection.ready()).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert!(store.auth_key(&server.dc()).unwrap().is_some());
    assert_eq!(store.main_dc().unwrap(), Some(server.dc()));
    assert_eq!(server.seen(), vec![schema::INVOKE_WITH_LAYER]);

    connection.close();
    within(connection.closed()).await;
}

#[tokio::test]
async fn request_made_before_ready_is_flushed_and_resolved() {
    let server = server().await;
    let connection = Connection::connect(Arc::new(server.config()), server.dc(), DcId::Main);

    // issued right away, while the connection is still connecting
    let answer = within(connection.invoke_raw(method(ECHO))).await.unwrap();
    assert_eq!(answer, method(ECHO).body);
    assert_eq!(server.seen(), vec![schema::INVOKE_WITH_LAYER, ECHO]);
    assert!(connection.stats().last_query_at().is_some());
    connection.close();
}

#[tokio::test]
async fn unauthorized_error_delays_later_calls() {
    let server = server().await;
    let connection = Connection::connect(Arc::new(server.config()), server.dc(), DcId::Main);
    within(connection.ready()).await.unwrap();

    let err = within(connection.invoke_raw(method(LOGOUT))).await.unwrap_err();
    let InvocationError::Rpc(error) = err else { panic!("expected an rpc error, got {err:?}") };
    assert_eq!(error.code, 401);
    assert_eq!(error.method, Some(LOGOUT));

    let delayed = tokio::time::timeout(Duration::from_millis(500), connection.invoke_raw(method(PROTECTED))).await;
    assert!(delayed.is_err(), "call went out while unauthorized");
    assert!(!server.seen().contains(&PROTECTED));
    connection.close();
}

#[tokio::test]
async fn authorization_flushes_delayed_calls() {
    let server = server().await;
    let connection = Connection::connect(Arc::new(server.config()), server.dc(), DcId::Main);
    within(connection.ready()).await.unwrap();
    let _ = within(connection.invoke_raw(method(LOGOUT))).await;

    let delayed = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke_raw(method(PROTECTED)).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!server.seen().contains(&PROTECTED));

    let mut check = schema::AUTH_CHECK_PASSWORD.to_le_bytes().to_vec();
    check.extend([0; 4]);
    let authorization = within(connection.invoke_raw(RawMethod::from_body(check))).await.unwrap();
    assert_eq!(authorization, schema::AUTH_AUTHORIZATION.to_le_bytes());

    let answer = within(delayed).await.unwrap().unwrap();
    assert_eq!(answer, vec![0xaa, 0xbb, 0xcc, 0xdd]);
    assert_eq!(server.seen().last(), Some(&PROTECTED));
    connection.close();
}

#[tokio::test]
async fn calls_after_close_are_discarded() {
    let server = server().await;
    let connection = Connection::connect(Arc::new(server.config()), server.dc(), DcId::Main);
    within(connection.ready()).await.unwrap();
    connection.close();
    within(connection.closed()).await;

    let result = connection.invoke_raw(method(ECHO)).await;
    assert_eq!(result, Err(InvocationError::Discarded));
}

#[tokio::test]
async fn call_made_during_backoff_is_sent_after_reconnect() {
    let server = server().await;
    let config = retrying(&server, Duration::from_millis(300));
    let connection = Connection::connect(Arc::new(config), server.dc(), DcId::Main);
    within(connection.ready()).await.unwrap();

    let lost = within(connection.invoke_raw(method(DROP))).await;
    assert_eq!(lost, Err(InvocationError::Cancelled));
    within(until(|| connection.state() == ConnectionState::Disconnected)).await;

    let answer = within(connection.invoke_raw(method(ECHO))).await.unwrap();
    assert_eq!(answer, method(ECHO).body);
    assert_eq!(server.connections(), 2);
    assert_eq!(server.handshakes(), 1, "cached key should be reused");

    // the new session tells the server to drop the old one first
    let sessions = server.sessions();
    assert_eq!(sessions.len(), 2);
    assert_ne!(sessions[0], sessions[1]);
    assert_eq!(server.destroyed(), vec![sessions[0]]);
    let seen = server.seen();
    assert_eq!(
        seen[seen.len() - 3..],
        [DestroySession::CONSTRUCTOR_ID, schema::INVOKE_WITH_LAYER, ECHO]
    );
    connection.close();
}

#[tokio::test]
async fn rejected_auth_key_is_regenerated() {
    let server = server().await;
    let config = retrying(&server, Duration::from_millis(50));
    let store = Arc::clone(&config.store);
    let connection = Connection::connect(Arc::new(config), server.dc(), DcId::Main);
    within(connection.ready()).await.unwrap();
    let first_key = store.auth_key(&server.dc()).unwrap().unwrap().id();

    let lost = within(connection.invoke_raw(method(FORGET))).await;
    assert_eq!(lost, Err(InvocationError::Cancelled));

    let answer = within(connection.invoke_raw(method(ECHO))).await.unwrap();
    assert_eq!(answer, method(ECHO).body);
    assert_eq!(server.handshakes(), 2);
    let second_key = store.auth_key(&server.dc()).unwrap().unwrap().id();
    assert_ne!(first_key, second_key);
    connection.close();
}

#[tokio::test]
async fn unanswered_ping_forces_reconnect() {
    let server = server().await;
    server.set_answer_pings(false);
    let config = Config { ping_interval: Duration::from_millis(100), ..retrying(&server, Duration::from_millis(10)) };
    let connection = Connection::connect(Arc::new(config), server.dc(), DcId::Main);
    within(connection.ready()).await.unwrap();

    within(until(|| server.connections() >= 2)).await;
    assert_eq!(server.handshakes(), 1);

    server.set_answer_pings(true);
    within(until(|| connection.state() == ConnectionState::Ready)).await;
    connection.close();
    within(connection.closed()).await;
}
