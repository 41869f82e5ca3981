//! # Append Notifications
//!
//! Subscriptions sleep while they are caught up and wake when something may
//! have been appended. The signal carries no data: a woken subscription just
//! reads its next page.
//!
//! ```text
//!   PushNotifier                         PollingNotifier
//!   ────────────                         ───────────────
//!   append ──► notify_appended()         every interval:
//!                   │                      head = read_head_position()
//!                   ▼                      head > last seen? ──► signal
//!          broadcast::Sender<()>                    │
//!                   │                               ▼
//!                   └──────► subscribers ◄── broadcast::Sender<()>
//! ```
//!
//! Push only sees appends made through this store instance. Polling also sees
//! writes from other processes sharing the same database.
//!
//! A slow subscriber that misses signals gets `RecvError::Lagged`, which it
//! treats as a signal too. Nothing is lost because the data is re-read.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::Result;

/// Default interval for [`PollingNotifier`].
pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 1000;

/// Capacity of the signal channel. Signals are idempotent, so lagging is harmless.
const SIGNAL_CAPACITY: usize = 16;

/// How a store learns about new messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifierKind {
    /// Signal on every append through this store.
    #[default]
    Push,
    /// Poll the head position at the given interval.
    Polling(Duration),
}

impl NotifierKind {
    pub fn polling() -> Self {
        NotifierKind::Polling(Duration::from_millis(DEFAULT_POLLING_INTERVAL_MS))
    }
}

/// Source of "something was appended" signals.
pub trait StreamStoreNotifier: Send + Sync + 'static {
    /// A receiver for future signals.
    fn subscribe(&self) -> broadcast::Receiver<()>;

    /// Called by the store after every append that wrote messages.
    fn notify_appended(&self);
}

// =============================================================================
// Push
// =============================================================================

/// Signals subscribers directly from the append path.
#[derive(Debug)]
pub struct PushNotifier {
    signal_tx: broadcast::Sender<()>,
}

impl PushNotifier {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { signal_tx }
    }
}

impl Default for PushNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStoreNotifier for PushNotifier {
    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.signal_tx.subscribe()
    }

    fn notify_appended(&self) {
        // No receivers is not an error.
        let _ = self.signal_tx.send(());
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Signals subscribers when the store's head position moves forward.
#[derive(Debug)]
pub struct PollingNotifier {
    signal_tx: broadcast::Sender<()>,
}

impl PollingNotifier {
    /// Spawns the polling task. It stops when `cancel` fires.
    pub fn spawn<F, Fut>(interval: Duration, read_head_position: F, cancel: CancellationToken) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<i64>> + Send + 'static,
    {
        let (signal_tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        let task_tx = signal_tx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_head = -1i64;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match read_head_position().await {
                    Ok(head) if head > last_head => {
                        trace!(head, "head position advanced");
                        last_head = head;
                        let _ = task_tx.send(());
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "failed to poll head position"),
                }
            }
        });

        Self { signal_tx }
    }
}

impl StreamStoreNotifier for PollingNotifier {
    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.signal_tx.subscribe()
    }

    fn notify_appended(&self) {}
}
