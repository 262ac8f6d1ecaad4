//! Per-purpose connection pool.
//!
//! A [`ClientGroup`] owns the main connection plus, for every data center,
//! up to `max_connections` upload and `max_connections` download
//! connections. Calls are routed by [`DcId`]: `Main` goes to the main
//! connection, uploads and downloads go to a pinned slot or, with
//! [`Shift::Auto`], to the least-loaded connection of their kind. A
//! background task closes idle transfer connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use telecore_tl::{Deserializable, RemoteCall};

use crate::config::{Config, GroupConfig};
use crate::connection::Connection;
use crate::dc::{DataCenter, DcId, DcOptions, Shift};
use crate::errors::InvocationError;
use crate::request::RawMethod;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Slot selection ───────────────────────────────────────────────────────────

/// Outcome of [`select`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// Use the connection in this slot.
    Reuse(usize),
    /// Open a new connection into this free slot.
    Create(usize),
}

/// Choose a slot for an auto-shifted call.
///
/// `loads[i]` is the in-flight query count of slot `i`, or `None` when the
/// slot is empty. The least-loaded connection is reused unless every live
/// connection has reached `threshold` and there is still a free slot.
pub fn select(loads: &[Option<usize>], threshold: usize) -> Selection {
    let least = loads
        .iter()
        .enumerate()
        .filter_map(|(i, load)| load.map(|l| (i, l)))
        .min_by_key(|&(_, load)| load);
    let free = loads.iter().position(Option::is_none);

    match (least, free) {
        (None, Some(slot)) => Selection::Create(slot),
        (Some((_, load)), Some(slot)) if load >= threshold => Selection::Create(slot),
        (Some((i, _)), _) => Selection::Reuse(i),
        // zero slots; callers never pass an empty table
        (None, None) => Selection::Create(0),
    }
}

// ─── Slots ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Transfer {
    Upload,
    Download,
}

/// Fixed-size row of connection cells for one (transfer kind, DC) pair.
struct Slots {
    cells: Vec<Mutex<Option<Connection>>>,
}

impl Slots {
    fn new(cap: usize) -> Self {
        Self { cells: (0..cap).map(|_| Mutex::new(None)).collect() }
    }

    /// Live connection in `index`, clearing the cell if it has closed.
    fn live(&self, index: usize) -> Option<Connection> {
        let mut cell = lock(&self.cells[index]);
        if cell.as_ref().is_some_and(Connection::is_closed) {
            *cell = None;
        }
        cell.clone()
    }

    fn loads(&self) -> Vec<Option<usize>> {
        (0..self.cells.len())
            .map(|i| self.live(i).map(|c| c.stats().queries()))
            .collect()
    }

    /// Install `connection` if `index` is still empty. Otherwise the
    /// connection already there wins and `connection` is closed.
    fn install(&self, index: usize, connection: Connection) -> Connection {
        let mut cell = lock(&self.cells[index]);
        match cell.as_ref() {
            Some(winner) if !winner.is_closed() => {
                tracing::debug!("[{}] lost slot {index} to [{}]", connection.tag(), winner.tag());
                connection.close();
                winner.clone()
            }
            _ => {
                *cell = Some(connection.clone());
                connection
            }
        }
    }
}

struct Inner {
    config:  Arc<Config>,
    group:   GroupConfig,
    options: Mutex<DcOptions>,
    main:    Mutex<Option<Connection>>,
    slots:   Mutex<HashMap<(Transfer, i32), Arc<Slots>>>,
}

impl Inner {
    fn slots(&self, transfer: Transfer, dc: i32) -> Arc<Slots> {
        let mut slots = lock(&self.slots);
        let row = slots
            .entry((transfer, dc))
            .or_insert_with(|| Arc::new(Slots::new(self.group.max_connections)));
        Arc::clone(row)
    }

    fn endpoint(&self, purpose: DcId, dc: i32) -> Result<DataCenter, InvocationError> {
        lock(&self.options)
            .find(purpose, dc)
            .cloned()
            .ok_or_else(|| InvocationError::Routing(format!("no endpoint for DC{dc}")))
    }

    fn open(&self, purpose: DcId, dc: i32) -> Result<Connection, InvocationError> {
        let endpoint = self.endpoint(purpose, dc)?;
        let connection = Connection::connect(Arc::clone(&self.config), endpoint, purpose);
        tracing::debug!("[{}] opened for {purpose:?}", connection.tag());
        Ok(connection)
    }

    fn sweep(&self) {
        let rows: Vec<Arc<Slots>> = lock(&self.slots).values().cloned().collect();
        for row in rows {
            for cell in &row.cells {
                let mut cell = lock(cell);
                let evict = cell.as_ref().is_some_and(|c| {
                    c.is_closed() || (c.stats().queries() == 0 && c.idle_for() >= self.group.idle_timeout)
                });
                if evict {
                    if let Some(connection) = cell.take() {
                        tracing::debug!("[{}] closing idle {:?} connection", connection.tag(), connection.purpose());
                        connection.close();
                    }
                }
            }
        }
    }
}

// ─── ClientGroup ──────────────────────────────────────────────────────────────

/// Routes calls to main, upload and download connections.
pub struct ClientGroup {
    inner: Arc<Inner>,
    sweep: CancellationToken,
}

impl ClientGroup {
    /// Connect the main connection to `main` and start the idle sweep.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: Config, group: GroupConfig, options: DcOptions, main: DataCenter) -> Self {
        let config = Arc::new(config);
        let main = Connection::connect(Arc::clone(&config), main, DcId::Main);
        let inner = Arc::new(Inner {
            config,
            group,
            options: Mutex::new(options),
            main: Mutex::new(Some(main)),
            slots: Mutex::new(HashMap::new()),
        });

        let sweep = CancellationToken::new();
        tokio::spawn(sweep_task(Arc::downgrade(&inner), group, sweep.clone()));
        Self { inner, sweep }
    }

    /// The current main connection.
    pub fn main(&self) -> Result<Connection, InvocationError> {
        lock(&self.inner.main)
            .clone()
            .ok_or_else(|| InvocationError::Routing("group is closed".into()))
    }

    /// Switch the main connection to `dc`.
    ///
    /// The new connection must become ready before it replaces the old one,
    /// which is then closed.
    pub async fn set_main(&self, dc: DataCenter) -> Result<(), InvocationError> {
        let next = Connection::connect(Arc::clone(&self.inner.config), dc, DcId::Main);
        if let Err(e) = next.ready().await {
            next.close();
            return Err(e);
        }
        let previous = lock(&self.inner.main).replace(next);
        if let Some(previous) = previous {
            tracing::info!("[{}] replaced as main connection", previous.tag());
            previous.close();
        }
        Ok(())
    }

    /// Replace the known endpoints and persist them.
    pub fn set_dc_options(&self, options: Vec<DataCenter>) {
        if let Err(e) = self.inner.config.store.update_dc_options(&options) {
            tracing::warn!("could not save DC options: {e}");
        }
        lock(&self.inner.options).replace(options);
    }

    /// The connection a call for `dc` goes to, opening one if needed.
    pub fn connection(&self, dc: DcId) -> Result<Connection, InvocationError> {
        let (transfer, id, shift) = match dc {
            DcId::Main => return self.main(),
            DcId::Upload { dc, shift } => (Transfer::Upload, dc, shift),
            DcId::Download { dc, shift } => (Transfer::Download, dc, shift),
        };
        let slots = self.inner.slots(transfer, id);
        let cap = slots.cells.len();

        let index = match shift {
            Shift::Index(k) if usize::from(k) >= cap => {
                return Err(InvocationError::Routing(format!("slot {k} is out of range (max {cap})")));
            }
            Shift::Index(k) => {
                let k = usize::from(k);
                if let Some(existing) = slots.live(k) {
                    return Ok(existing);
                }
                k
            }
            Shift::Auto => match select(&slots.loads(), self.inner.group.load_threshold) {
                Selection::Reuse(i) => match slots.live(i) {
                    Some(existing) => return Ok(existing),
                    None => i,
                },
                Selection::Create(i) => i,
            },
        };

        let connection = self.inner.open(dc, id)?;
        Ok(slots.install(index, connection))
    }

    /// Call `request` on the connection for `dc` and decode its result.
    pub async fn invoke<R: RemoteCall>(&self, dc: DcId, request: &R) -> Result<R::Return, InvocationError> {
        let bytes = self.invoke_raw(dc, RawMethod::new(request)).await?;
        Ok(R::Return::from_bytes(&bytes)?)
    }

    pub async fn invoke_raw(&self, dc: DcId, method: RawMethod) -> Result<Vec<u8>, InvocationError> {
        self.connection(dc)?.invoke_raw(method).await
    }

    /// Close every connection and stop the sweep.
    pub fn close(&self) {
        self.sweep.cancel();
        if let Some(main) = lock(&self.inner.main).take() {
            main.close();
        }
        let rows: Vec<Arc<Slots>> = lock(&self.inner.slots).drain().map(|(_, row)| row).collect();
        for row in rows {
            for cell in &row.cells {
                if let Some(connection) = lock(cell).take() {
                    connection.close();
                }
            }
        }
    }
}

impl Drop for ClientGroup {
    fn drop(&mut self) {
        self.sweep.cancel();
    }
}

async fn sweep_task(inner: std::sync::Weak<Inner>, group: GroupConfig, token: CancellationToken) {
    let start = tokio::time::Instant::now() + group.sweep_interval;
    let mut interval = tokio::time::interval_at(start, group.sweep_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.sweep();
            }
        }
    }
}
