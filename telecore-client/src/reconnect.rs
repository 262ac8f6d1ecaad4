//! Reconnection policies.
//!
//! After a resumable [`ConnectionError`] the connection asks its
//! [`ReconnectionStrategy`] how long to wait before the next attempt, or
//! whether to give up and close.

use std::time::Duration;

use crate::errors::ConnectionError;

/// State carried between consecutive failed attempts.
#[derive(Clone, Debug, Default)]
pub struct ReconnectionContext {
    /// Failed attempts since the last successful connect, starting at 1.
    pub iteration:    u32,
    pub last_backoff: Option<Duration>,
    pub error:        Option<ConnectionError>,
}

impl ReconnectionContext {
    pub fn increment(&mut self, error: ConnectionError) {
        self.iteration = self.iteration.saturating_add(1);
        self.error = Some(error);
    }

    pub fn reset_after_connect(&mut self) {
        *self = Self::default();
    }
}

/// Controls how a connection reacts when its socket is lost.
pub trait ReconnectionStrategy: Send + Sync + 'static {
    /// The delay before the next attempt, or `None` to give up.
    fn compute_backoff(&self, ctx: &ReconnectionContext) -> Option<Duration>;
}

/// Reconnect right away, forever.
#[derive(Clone, Copy, Debug, Default)]
pub struct Immediately;

impl ReconnectionStrategy for Immediately {
    fn compute_backoff(&self, _: &ReconnectionContext) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// Wait a fixed delay, giving up after `max_attempts` failures.
#[derive(Clone, Copy, Debug)]
pub struct FixedInterval {
    pub delay:        Duration,
    pub max_attempts: u32,
}

impl ReconnectionStrategy for FixedInterval {
    fn compute_backoff(&self, ctx: &ReconnectionContext) -> Option<Duration> {
        if ctx.iteration >= self.max_attempts {
            None
        } else {
            Some(self.delay)
        }
    }
}

/// Retry immediately a few times, then back off exponentially.
///
/// The delay is zero while `iteration <= no_backoff_attempts`, then
/// `base * 2^(min(iteration - no_backoff_attempts, max_increase) - 1)`.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    pub no_backoff_attempts: u32,
    pub max_increase:        u32,
    pub base:                Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self { no_backoff_attempts: 3, max_increase: 5, base: Duration::from_secs(1) }
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn compute_backoff(&self, ctx: &ReconnectionContext) -> Option<Duration> {
        if ctx.iteration <= self.no_backoff_attempts {
            return Some(Duration::ZERO);
        }
        let step = (ctx.iteration - self.no_backoff_attempts).min(self.max_increase.max(1));
        Some(self.base.saturating_mul(1u32 << (step - 1).min(31)))
    }
}
