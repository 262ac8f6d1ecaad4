//! One MTProto connection to one data center, run as a tokio task.
//!
//! A [`Connection`] is a cheap handle. The task behind it owns the socket,
//! the [`Sender`] and the queue of calls made before the session is ready.
//! It connects, runs the authorization handshake when no key is known,
//! initializes the session and then multiplexes socket reads, caller
//! commands, pings and resend timers until the socket fails. Failures are
//! handed to the configured [`ReconnectionStrategy`](crate::ReconnectionStrategy).

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use telecore_crypto::fill_random;
use telecore_mtproto::authentication::{self, Finished, HandshakeContext};
use telecore_mtproto::inbound::DecodeError;
use telecore_mtproto::plain::PlainMessage;
use telecore_mtproto::{AuthData, Transport};
use telecore_tl::mtproto::DestroySession;
use telecore_tl::{Deserializable, RemoteCall};

use crate::config::Config;
use crate::dc::{DataCenter, DcId, DcKind};
use crate::errors::{ConnectionError, InvocationError};
use crate::outbound::Sender;
use crate::reconnect::ReconnectionContext;
use crate::request::{RawMethod, Request, ResultSink};
use crate::stats::Stats;

// ─── ConnectionState ──────────────────────────────────────────────────────────

/// Where a connection is in its lifecycle. `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Generating an authorization key.
    Handshake,
    Ready,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting   => "connecting",
            Self::Handshake    => "handshake",
            Self::Ready        => "ready",
            Self::Closed       => "closed",
        };
        f.write_str(s)
    }
}

enum Command {
    Invoke { method: RawMethod, sink: ResultSink },
    Close,
}

struct Shared {
    tag:     String,
    dc:      DataCenter,
    purpose: DcId,
    state:   watch::Sender<ConnectionState>,
    stats:   Arc<Stats>,
    created: Instant,
}

// ─── Connection ───────────────────────────────────────────────────────────────

/// Handle to a connection task. Clones share the same task.
#[derive(Clone)]
pub struct Connection {
    shared:   Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("tag", &self.shared.tag)
            .field("dc", &self.shared.dc)
            .field("purpose", &self.shared.purpose)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Spawn the connection task for `dc` and start connecting.
    ///
    /// Must be called inside a tokio runtime. Calls made before the
    /// session is ready are queued.
    pub fn connect(config: Arc<Config>, dc: DataCenter, purpose: DcId) -> Self {
        let mut id = [0u8; 4];
        fill_random(&mut id);
        let tag = format!("C:{:08x}", u32::from_le_bytes(id));

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let stats = Arc::new(Stats::new());
        let shared = Arc::new(Shared {
            tag: tag.clone(),
            dc,
            purpose,
            state,
            stats: Arc::clone(&stats),
            created: Instant::now(),
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let auth = AuthData::new(None, config.register_capacity);
        let sender = Sender::new(tag, auth, &config, stats);
        let actor = Actor {
            shared: Arc::clone(&shared),
            config,
            commands: receiver,
            sender,
            pending: VecDeque::new(),
            reconnect: ReconnectionContext::default(),
        };
        tokio::spawn(actor.run());

        Self { shared, commands }
    }

    /// Call `request` and decode its result.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        let bytes = self.invoke_raw(RawMethod::new(request)).await?;
        Ok(R::Return::from_bytes(&bytes)?)
    }

    /// Call a serialized method and return the raw result.
    pub async fn invoke_raw(&self, method: RawMethod) -> Result<Vec<u8>, InvocationError> {
        let (sink, result) = oneshot::channel();
        self.commands
            .send(Command::Invoke { method, sink })
            .map_err(|_| InvocationError::Discarded)?;
        result.await.map_err(|_| InvocationError::Dropped)?
    }

    /// Wait until the session is initialized. Fails if the connection
    /// closes first.
    pub async fn ready(&self) -> Result<(), InvocationError> {
        let mut state = self.shared.state.subscribe();
        match state
            .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Closed))
            .await
        {
            Ok(s) if *s == ConnectionState::Ready => Ok(()),
            _ => Err(InvocationError::Discarded),
        }
    }

    /// Ask the task to stop. Everything in flight or queued fails.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Resolves once the connection has reached [`ConnectionState::Closed`].
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn stats(&self) -> &Stats {
        &self.shared.stats
    }

    pub fn dc(&self) -> &DataCenter {
        &self.shared.dc
    }

    pub fn purpose(&self) -> DcId {
        self.shared.purpose
    }

    /// The `C:xxxxxxxx` tag used in this connection's log lines.
    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    /// Time since the last query, or since creation if there was none.
    pub fn idle_for(&self) -> Duration {
        match self.shared.stats.last_query_at() {
            Some(at) => SystemTime::now().duration_since(at).unwrap_or_default(),
            None => self.shared.created.elapsed(),
        }
    }
}

// ─── Actor ────────────────────────────────────────────────────────────────────

struct Actor {
    shared:    Arc<Shared>,
    config:    Arc<Config>,
    commands:  mpsc::UnboundedReceiver<Command>,
    sender:    Sender,
    /// Calls made while the session was not ready, in order.
    pending:   VecDeque<(RawMethod, ResultSink)>,
    reconnect: ReconnectionContext,
}

/// A freshly opened socket with the transport already announced.
struct Socket {
    stream:    TcpStream,
    transport: Box<dyn Transport>,
    buffer:    Vec<u8>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let error = match self.session().await {
                Ok(()) => break,
                Err(e) => e,
            };
            tracing::warn!("[{}] connection to {} lost: {error}", self.shared.tag, self.shared.dc);

            self.sender.cancel_in_flight();
            if let ConnectionError::Transport(-404) = error {
                tracing::warn!("[{}] auth key rejected; a new one will be generated", self.shared.tag);
                self.sender.auth.clear_auth_key();
                if let Err(e) = self.config.store.update_auth_key(&self.shared.dc, None) {
                    tracing::warn!("[{}] could not forget auth key: {e}", self.shared.tag);
                }
            }

            let resumable = error.is_resumable();
            self.reconnect.increment(error);
            let backoff = if resumable {
                self.config.reconnection.compute_backoff(&self.reconnect)
            } else {
                None
            };
            let Some(delay) = backoff else {
                tracing::warn!(
                    "[{}] giving up after {} attempts",
                    self.shared.tag, self.reconnect.iteration
                );
                break;
            };

            self.reconnect.last_backoff = Some(delay);
            self.set_state(ConnectionState::Disconnected);
            self.sender.auth.reset_session();
            tracing::info!(
                "[{}] reconnecting in {delay:?} (attempt {})",
                self.shared.tag, self.reconnect.iteration
            );
            if !self.wait(delay).await {
                break;
            }
        }
        self.shutdown();
    }

    fn set_state(&self, state: ConnectionState) {
        let old = self.shared.state.send_replace(state);
        if old != state {
            tracing::debug!("[{}] {old} -> {state}", self.shared.tag);
        }
    }

    fn enqueue(&mut self, method: RawMethod, sink: ResultSink) {
        queue_pending(&mut self.pending, self.config.pending_capacity, &self.shared.tag, method, sink);
    }

    /// Sleep for `delay` while still accepting calls. `false` means close
    /// was requested.
    async fn wait(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Invoke { method, sink }) => self.enqueue(method, sink),
                    Some(Command::Close) | None => return false,
                },
            }
        }
    }

    /// Connect and serve until the socket fails. `Ok` means close was
    /// requested.
    async fn session(&mut self) -> Result<(), ConnectionError> {
        self.set_state(ConnectionState::Connecting);

        let socket = {
            let establish = establish(&self.shared, &self.config, &mut self.sender);
            tokio::pin!(establish);
            loop {
                tokio::select! {
                    socket = &mut establish => break socket?,
                    command = self.commands.recv() => match command {
                        Some(Command::Invoke { method, sink }) => queue_pending(
                            &mut self.pending,
                            self.config.pending_capacity,
                            &self.shared.tag,
                            method,
                            sink,
                        ),
                        Some(Command::Close) | None => return Ok(()),
                    },
                }
            }
        };

        self.serve(socket).await
    }

    async fn serve(&mut self, socket: Socket) -> Result<(), ConnectionError> {
        let Socket { stream, mut transport, mut buffer } = socket;
        let (mut reader, mut writer) = stream.into_split();
        let now = Instant::now();

        let period = if self.shared.purpose.is_media() || self.shared.dc.kind != DcKind::Regular {
            self.config.media_ping_interval
        } else {
            self.config.ping_interval
        };
        let mut ping = tokio::time::interval_at(now + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let old_session = self.sender.auth.take_old_session_id();
        if old_session != 0 {
            tracing::debug!("[{}] destroying old session {old_session:#x}", self.shared.tag);
            let destroy = DestroySession { session_id: old_session };
            self.sender.write(Request::rpc(RawMethod::new(&destroy)), now)?;
        }

        let mut init = match self.config.init_request() {
            Some(method) => {
                let (sink, result) = oneshot::channel();
                self.sender.write(Request::query(method, sink), now)?;
                Some(result)
            }
            None => {
                self.on_ready(now)?;
                None
            }
        };
        self.flush(&mut writer, transport.as_mut()).await?;

        loop {
            let resend_at = self.sender.resend_at;
            tokio::select! {
                read = reader.read_buf(&mut buffer) => {
                    if read? == 0 {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the socket").into());
                    }
                    while let Some(payload) = transport.decode(&mut buffer)? {
                        self.sender.handle_frame(payload, Instant::now())?;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Invoke { method, sink }) => {
                        if *self.shared.state.borrow() == ConnectionState::Ready {
                            self.sender.write(Request::query(method, sink), Instant::now())?;
                        } else {
                            self.enqueue(method, sink);
                        }
                    }
                    Some(Command::Close) | None => return Ok(()),
                },
                _ = ping.tick() => {
                    if self.sender.ping_in_flight() {
                        return Err(ConnectionError::PingTimeout);
                    }
                    let mut ping_id = [0u8; 8];
                    fill_random(&mut ping_id);
                    self.sender.send_ping(i64::from_le_bytes(ping_id), Instant::now())?;
                }
                _ = tokio::time::sleep_until(resend_at.unwrap_or_else(Instant::now)), if resend_at.is_some() => {
                    self.sender.fire_resend(Instant::now())?;
                }
                result = wait_init(&mut init), if init.is_some() => {
                    init = None;
                    match result {
                        Ok(Ok(_)) => self.on_ready(Instant::now())?,
                        Ok(Err(InvocationError::Rpc(e))) => return Err(ConnectionError::Init(e)),
                        Ok(Err(e)) => {
                            return Err(io::Error::other(format!("session init failed: {e}")).into());
                        }
                        Err(_) => return Err(io::Error::other("session init was dropped").into()),
                    }
                }
            }
            self.flush(&mut writer, transport.as_mut()).await?;
        }
    }

    /// The session is initialized: flush everything that waited for it.
    fn on_ready(&mut self, now: Instant) -> Result<(), ConnectionError> {
        self.reconnect.reset_after_connect();
        self.set_state(ConnectionState::Ready);
        tracing::info!("[{}] ready on {}", self.shared.tag, self.shared.dc);

        if self.shared.purpose == DcId::Main {
            if let Err(e) = self.config.store.update_main_dc(&self.shared.dc) {
                tracing::warn!("[{}] could not save main DC: {e}", self.shared.tag);
            }
        }

        if !self.sender.resend_queue.is_empty() {
            self.sender.resend(now)?;
        }
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            tracing::debug!("[{}] flushing {} queued requests", self.shared.tag, pending.len());
        }
        for (method, sink) in pending {
            self.sender.write(Request::query(method, sink), now)?;
        }
        Ok(())
    }

    async fn flush(&mut self, writer: &mut OwnedWriteHalf, transport: &mut dyn Transport) -> Result<(), ConnectionError> {
        if self.sender.out.is_empty() {
            return Ok(());
        }
        let mut wire = Vec::new();
        for out in self.sender.out.drain(..) {
            transport.encode(&out.frame, out.quick_ack.is_some(), &mut wire);
        }
        writer.write_all(&wire).await?;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.sender.cancel_all();
        for (_, sink) in self.pending.drain(..) {
            let _ = sink.send(Err(InvocationError::Cancelled));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Invoke { sink, .. } = command {
                let _ = sink.send(Err(InvocationError::Discarded));
            }
        }
        tracing::info!("[{}] closed", self.shared.tag);
    }
}

/// Hold a call until the session is ready. A full queue discards it.
fn queue_pending(
    pending:  &mut VecDeque<(RawMethod, ResultSink)>,
    capacity: usize,
    tag:      &str,
    method:   RawMethod,
    sink:     ResultSink,
) {
    if pending.len() >= capacity {
        tracing::warn!("[{tag}] pending queue full; discarding {:#010x}", method.constructor_id);
        let _ = sink.send(Err(InvocationError::Discarded));
        return;
    }
    pending.push_back((method, sink));
}

async fn wait_init(
    init: &mut Option<oneshot::Receiver<Result<Vec<u8>, InvocationError>>>,
) -> Result<Result<Vec<u8>, InvocationError>, oneshot::error::RecvError> {
    match init {
        Some(result) => result.await,
        None => std::future::pending().await,
    }
}

// ─── Connecting ───────────────────────────────────────────────────────────────

/// Open the socket and make sure the session has an auth key.
async fn establish(shared: &Shared, config: &Config, sender: &mut Sender) -> Result<Socket, ConnectionError> {
    let addr = shared.dc.socket_addr();
    tracing::debug!("[{}] connecting to {addr}", shared.tag);
    let mut stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out")))??;
    stream.set_nodelay(true)?;

    let transport = config.transport.build();
    stream.write_all(transport.init_bytes()).await?;
    let mut socket = Socket { stream, transport, buffer: Vec::new() };

    if sender.auth.auth_key().is_none() {
        match config.store.auth_key(&shared.dc) {
            Ok(Some(key)) => {
                tracing::debug!("[{}] using stored auth key {:#x}", shared.tag, key.id());
                sender.auth.set_auth_key(key, 0, 0);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("[{}] could not load auth key: {e}", shared.tag),
        }
    }

    if sender.auth.auth_key().is_none() {
        let _ = shared.state.send_replace(ConnectionState::Handshake);
        tracing::info!("[{}] generating auth key with {}", shared.tag, shared.dc);
        let Finished { auth_key, time_offset, first_salt } =
            handshake(shared, config, &mut sender.auth, &mut socket).await?;
        tracing::info!("[{}] auth key {:#x} ready", shared.tag, auth_key.id());
        if let Err(e) = config.store.update_auth_key(&shared.dc, Some(&auth_key)) {
            tracing::warn!("[{}] could not save auth key: {e}", shared.tag);
        }
        sender.auth.set_auth_key(auth_key, first_salt, time_offset);
    }
    Ok(socket)
}

async fn handshake(
    shared: &Shared,
    config: &Config,
    auth:   &mut AuthData,
    socket: &mut Socket,
) -> Result<Finished, ConnectionError> {
    let mut ctx = HandshakeContext::new(
        shared.dc.internal_id(),
        Arc::clone(&config.keys),
        Arc::clone(&config.primes),
    );
    ctx.expires_in = config.temp_key_expires_in;

    let (request, step1) = authentication::step1();
    let res_pq = plain_call(config, auth, socket, &request).await?;
    let (request, step2) = authentication::step2(&ctx, step1, res_pq)?;
    tracing::debug!("[{}] handshake: pq factorized", shared.tag);

    let params = plain_call(config, auth, socket, &request).await?;
    let (request, step3) = authentication::step3(&ctx, step2, params)?;
    tracing::debug!("[{}] handshake: DH parameters accepted", shared.tag);

    let answer = plain_call(config, auth, socket, &request).await?;
    Ok(authentication::finish(step3, answer)?)
}

/// One unencrypted round trip, bounded by the handshake step timeout.
async fn plain_call<R: RemoteCall>(
    config:  &Config,
    auth:    &mut AuthData,
    socket:  &mut Socket,
    request: &R,
) -> Result<R::Return, ConnectionError> {
    let message = PlainMessage::new(auth.next_message_id(), request.to_bytes());
    let mut wire = Vec::new();
    socket.transport.encode(&message.to_bytes(), false, &mut wire);
    socket.stream.write_all(&wire).await?;

    let payload = tokio::time::timeout(config.handshake_step_timeout, read_frame(socket))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)??;
    if payload.len() == 4 {
        let code = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        return Err(ConnectionError::Transport(code));
    }
    let answer = PlainMessage::from_frame(&payload)?;
    Ok(R::Return::from_bytes(&answer.body).map_err(DecodeError::from)?)
}

async fn read_frame(socket: &mut Socket) -> Result<Vec<u8>, ConnectionError> {
    loop {
        if let Some(frame) = socket.transport.decode(&mut socket.buffer)? {
            return Ok(frame);
        }
        if socket.stream.read_buf(&mut socket.buffer).await? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the socket").into());
        }
    }
}
