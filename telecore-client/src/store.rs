//! Pluggable persistence for keys and DC state.
//!
//! The [`Store`] trait abstracts over where authorization keys, the DC table,
//! the main DC and the signed-in user id live. Two stores are provided:
//!
//! * [`InMemoryStore`]: nothing touches the disk (default).
//! * [`BinaryFileStore`]: a compact binary file rewritten on every change.
//!
//! Store failures never take a connection down; the connection logs them and
//! carries on with what it has in memory.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use telecore_crypto::AuthKey;

use crate::dc::{DataCenter, DcKind};

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Where a connection keeps state that should outlive it.
pub trait Store: Send + Sync {
    /// The authorization key for `dc`, if one was saved.
    fn auth_key(&self, dc: &DataCenter) -> io::Result<Option<AuthKey>>;

    /// Save or forget the key for `dc`.
    fn update_auth_key(&self, dc: &DataCenter, key: Option<&AuthKey>) -> io::Result<()>;

    /// The saved DC table; empty when nothing was saved.
    fn dc_options(&self) -> io::Result<Vec<DataCenter>>;

    fn update_dc_options(&self, options: &[DataCenter]) -> io::Result<()>;

    fn main_dc(&self) -> io::Result<Option<DataCenter>>;

    fn update_main_dc(&self, dc: &DataCenter) -> io::Result<()>;

    fn user_id(&self) -> io::Result<Option<i64>>;

    fn update_user_id(&self, user_id: Option<i64>) -> io::Result<()>;
}

// ─── Shared state ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq)]
struct StoreState {
    main_dc:    Option<DataCenter>,
    user_id:    Option<i64>,
    /// Keyed by [`DataCenter::internal_id`].
    keys:       HashMap<i32, [u8; 256]>,
    dc_options: Vec<DataCenter>,
}

fn lock(state: &Mutex<StoreState>) -> io::Result<MutexGuard<'_, StoreState>> {
    state.lock().map_err(|_| io::Error::other("store lock poisoned"))
}

// ─── InMemoryStore ────────────────────────────────────────────────────────────

/// An ephemeral store that keeps everything in memory.
///
/// Useful for testing or for processes that should always start fresh.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for InMemoryStore {
    fn auth_key(&self, dc: &DataCenter) -> io::Result<Option<AuthKey>> {
        Ok(lock(&self.state)?.keys.get(&dc.internal_id()).map(|k| AuthKey::from_bytes(*k)))
    }

    fn update_auth_key(&self, dc: &DataCenter, key: Option<&AuthKey>) -> io::Result<()> {
        let mut state = lock(&self.state)?;
        match key {
            Some(k) => { state.keys.insert(dc.internal_id(), k.to_bytes()); }
            None    => { state.keys.remove(&dc.internal_id()); }
        }
        Ok(())
    }

    fn dc_options(&self) -> io::Result<Vec<DataCenter>> {
        Ok(lock(&self.state)?.dc_options.clone())
    }

    fn update_dc_options(&self, options: &[DataCenter]) -> io::Result<()> {
        lock(&self.state)?.dc_options = options.to_vec();
        Ok(())
    }

    fn main_dc(&self) -> io::Result<Option<DataCenter>> {
        Ok(lock(&self.state)?.main_dc.clone())
    }

    fn update_main_dc(&self, dc: &DataCenter) -> io::Result<()> {
        lock(&self.state)?.main_dc = Some(dc.clone());
        Ok(())
    }

    fn user_id(&self) -> io::Result<Option<i64>> {
        Ok(lock(&self.state)?.user_id)
    }

    fn update_user_id(&self, user_id: Option<i64>) -> io::Result<()> {
        lock(&self.state)?.user_id = user_id;
        Ok(())
    }
}

// ─── BinaryFileStore ──────────────────────────────────────────────────────────

/// A store backed by a compact binary file.
///
/// The whole file is loaded once on open and rewritten after every update
/// (via a temporary file and a rename).
pub struct BinaryFileStore {
    path:  PathBuf,
    state: Mutex<StoreState>,
}

impl BinaryFileStore {
    /// Open `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(buf) => decode(&buf)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, state: Mutex::new(state) })
    }

    /// Remove the file and forget everything (e.g. on sign-out).
    pub fn delete(&self) -> io::Result<()> {
        *lock(&self.state)? = StoreState::default();
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut StoreState)) -> io::Result<()> {
        let mut state = lock(&self.state)?;
        f(&mut state);
        let bytes = encode(&state);
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl Store for BinaryFileStore {
    fn auth_key(&self, dc: &DataCenter) -> io::Result<Option<AuthKey>> {
        Ok(lock(&self.state)?.keys.get(&dc.internal_id()).map(|k| AuthKey::from_bytes(*k)))
    }

    fn update_auth_key(&self, dc: &DataCenter, key: Option<&AuthKey>) -> io::Result<()> {
        let id = dc.internal_id();
        let key = key.map(AuthKey::to_bytes);
        self.update(|s| match key {
            Some(k) => { s.keys.insert(id, k); }
            None    => { s.keys.remove(&id); }
        })
    }

    fn dc_options(&self) -> io::Result<Vec<DataCenter>> {
        Ok(lock(&self.state)?.dc_options.clone())
    }

    fn update_dc_options(&self, options: &[DataCenter]) -> io::Result<()> {
        self.update(|s| s.dc_options = options.to_vec())
    }

    fn main_dc(&self) -> io::Result<Option<DataCenter>> {
        Ok(lock(&self.state)?.main_dc.clone())
    }

    fn update_main_dc(&self, dc: &DataCenter) -> io::Result<()> {
        self.update(|s| s.main_dc = Some(dc.clone()))
    }

    fn user_id(&self) -> io::Result<Option<i64>> {
        Ok(lock(&self.state)?.user_id)
    }

    fn update_user_id(&self, user_id: Option<i64>) -> io::Result<()> {
        self.update(|s| s.user_id = user_id)
    }
}

// ─── File format ─────────────────────────────────────────────────────────────
//
// version:u8
// has_main:u8 [dc]
// has_user:u8 [user_id:i64]
// key_count:u16 { internal_id:i32 key:[u8; 256] }
// dc_count:u16  { dc }
//
// dc = kind:u8 id:i32 port:u16 test:u8 addr_len:u8 addr

const FORMAT_VERSION: u8 = 1;

fn encode_dc(b: &mut Vec<u8>, dc: &DataCenter) {
    b.push(match dc.kind {
        DcKind::Regular => 0,
        DcKind::Media   => 1,
        DcKind::Cdn     => 2,
    });
    b.extend_from_slice(&dc.id.to_le_bytes());
    b.extend_from_slice(&dc.port.to_le_bytes());
    b.push(dc.test as u8);
    let ab = dc.address.as_bytes();
    b.push(ab.len() as u8);
    b.extend_from_slice(ab);
}

fn encode(state: &StoreState) -> Vec<u8> {
    let mut b = vec![FORMAT_VERSION];
    match &state.main_dc {
        Some(dc) => { b.push(1); encode_dc(&mut b, dc); }
        None     => { b.push(0); }
    }
    match state.user_id {
        Some(id) => { b.push(1); b.extend_from_slice(&id.to_le_bytes()); }
        None     => { b.push(0); }
    }
    let mut keys: Vec<_> = state.keys.iter().collect();
    keys.sort_by_key(|(id, _)| **id);
    b.extend_from_slice(&(keys.len() as u16).to_le_bytes());
    for (id, key) in keys {
        b.extend_from_slice(&id.to_le_bytes());
        b.extend_from_slice(key);
    }
    b.extend_from_slice(&(state.dc_options.len() as u16).to_le_bytes());
    for dc in &state.dc_options {
        encode_dc(&mut b, dc);
    }
    b
}

fn decode(buf: &[u8]) -> io::Result<StoreState> {
    let mut p = 0usize;
    macro_rules! r {
        ($n:expr) => {{
            if p + $n > buf.len() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated store"));
            }
            let s = &buf[p..p + $n];
            p += $n;
            s
        }};
    }
    macro_rules! fixed {
        ($n:literal) => {{
            let mut a = [0u8; $n];
            a.copy_from_slice(r!($n));
            a
        }};
    }
    macro_rules! dc {
        () => {{
            let kind = match r!(1)[0] {
                0 => DcKind::Regular,
                1 => DcKind::Media,
                2 => DcKind::Cdn,
                k => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, format!("unknown dc kind {k}")));
                }
            };
            let id      = i32::from_le_bytes(fixed!(4));
            let port    = u16::from_le_bytes(fixed!(2));
            let test    = r!(1)[0] != 0;
            let al      = r!(1)[0] as usize;
            let address = String::from_utf8_lossy(r!(al)).into_owned();
            DataCenter { kind, id, address, port, test }
        }};
    }

    let version = r!(1)[0];
    if version != FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported store version {version}"),
        ));
    }
    let main_dc = if r!(1)[0] == 1 { Some(dc!()) } else { None };
    let user_id = if r!(1)[0] == 1 { Some(i64::from_le_bytes(fixed!(8))) } else { None };

    let key_count = u16::from_le_bytes(fixed!(2)) as usize;
    let mut keys = HashMap::with_capacity(key_count);
    for _ in 0..key_count {
        let id = i32::from_le_bytes(fixed!(4));
        keys.insert(id, fixed!(256));
    }

    let dc_count = u16::from_le_bytes(fixed!(2)) as usize;
    let mut dc_options = Vec::with_capacity(dc_count);
    for _ in 0..dc_count {
        dc_options.push(dc!());
    }

    Ok(StoreState { main_dc, user_id, keys, dc_options })
}
