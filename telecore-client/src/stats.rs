//! Per-connection load counters, shared between the task and its handles.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// In-flight queries and the time of the last one sent.
///
/// The pool reads these to pick the least-loaded connection and to evict
/// idle ones.
#[derive(Debug, Default)]
pub struct Stats {
    queries:    AtomicUsize,
    /// Unix millis of the last query written; 0 when none was.
    last_query: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries written and not yet answered.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn last_query_at(&self) -> Option<SystemTime> {
        match self.last_query.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }

    pub(crate) fn record_queries(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.queries.fetch_add(n, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.last_query.store(now.max(1), Ordering::Relaxed);
    }

    pub(crate) fn query_finished(&self) {
        let _ = self.queries.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn reset_queries(&self) {
        self.queries.store(0, Ordering::Relaxed);
    }
}
