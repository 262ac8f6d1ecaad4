//! Delivery of server-pushed updates.
//!
//! Connections never decode updates. Every body whose constructor belongs to
//! the boxed `Updates` type is handed, still serialized, to the configured
//! [`UpdateDispatcher`] and acknowledged.

use tokio::sync::mpsc;

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Receives raw `Updates` bodies from every connection sharing a config.
///
/// Called from the connection task; implementations must not block.
pub trait UpdateDispatcher: Send + Sync {
    fn publish(&self, updates: Vec<u8>);
}

/// Drops every update.
#[derive(Clone, Copy, Debug, Default)]
pub struct IgnoreUpdates;

impl UpdateDispatcher for IgnoreUpdates {
    fn publish(&self, updates: Vec<u8>) {
        tracing::trace!("dropping {} bytes of updates", updates.len());
    }
}

// ─── ChannelDispatcher ───────────────────────────────────────────────────────

/// Forwards updates into an [`UpdateStream`].
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, UpdateStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UpdateStream { rx })
    }
}

impl UpdateDispatcher for ChannelDispatcher {
    fn publish(&self, updates: Vec<u8>) {
        if self.tx.send(updates).is_err() {
            tracing::debug!("update stream closed; dropping updates");
        }
    }
}

// ─── UpdateStream ─────────────────────────────────────────────────────────────

/// Asynchronous stream of raw `Updates` bodies.
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl UpdateStream {
    /// Wait for the next update. Returns `None` once the dispatcher is gone.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Constructor id of a body yielded by [`next`](Self::next).
    pub fn constructor_id(updates: &[u8]) -> Option<u32> {
        let id: [u8; 4] = updates.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(id))
    }
}
