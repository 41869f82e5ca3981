//! # Catch-Up Subscriptions
//!
//! A subscription replays history from a starting point and then keeps
//! delivering new messages as they are appended. It is a pull loop over the
//! ordinary read path, woken by the store's notifier:
//!
//! ```text
//!   Initializing ──► CatchingUp ──────────────► Live
//!        │            │   ▲   read page,          │   page empty and at end:
//!        │            │   │   deliver messages    │   wait for a signal
//!        │            │   └── is_end? no ◄────────┘   then read again
//!        ▼            ▼
//!     Disposed ◄── dispose(), store disposed, read error, handler error
//! ```
//!
//! ## Delivery
//!
//! Messages are handed to the [`SubscriptionHandler`] one at a time, in
//! version order (stream subscriptions) or position order (all-stream
//! subscriptions). The loop awaits each call before moving on, so a slow
//! handler slows the subscription down and nothing else. The cursor moves
//! only after a message was handled, so a restart from the reported
//! position redelivers at least the message that was in flight.
//!
//! ## Termination
//!
//! A subscription never reconnects. The first read error or handler error
//! ends it, and `subscription_dropped` is called exactly once with the reason.
//!
//! ## Rust Concepts
//!
//! - **`tokio::sync::watch`**: single-value channel; the loop publishes its
//!   state and the handle reads the latest one.
//! - **`tokio::sync::broadcast`**: the notifier's wake-up signal. A lagging
//!   receiver is just woken; it re-reads from its own cursor anyway.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::StreamStore;
use crate::backend::StreamStoreBackend;
use crate::error::{Error, Result};
use crate::stream_id::StreamId;
use crate::types::{PageReadStatus, Position, StreamMessage, StreamVersion};

// =============================================================================
// Configuration
// =============================================================================

/// Default number of messages read per page.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Error type handlers report failures with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-subscription options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Shown in logs. A random name is generated when unset.
    pub name: Option<String>,
    pub page_size: usize,
    /// Load message bodies with the page instead of on demand.
    pub prefetch: bool,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            name: None,
            page_size: DEFAULT_PAGE_SIZE,
            prefetch: true,
        }
    }
}

impl SubscriptionOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Resolving the starting point.
    Initializing,
    /// Reading history.
    CatchingUp,
    /// At the end, waiting for new messages.
    Live,
    /// Stopped for good.
    Disposed,
}

/// Why a subscription stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDroppedReason {
    /// The subscription or the store was disposed.
    Disposed,
    /// `message_received` returned an error.
    SubscriberError,
    /// Reading from the store failed.
    StreamStoreError,
}

/// Receives the messages of a subscription.
#[async_trait]
pub trait SubscriptionHandler: Send + 'static {
    /// Handles one message. Returning an error drops the subscription.
    async fn message_received(&mut self, message: StreamMessage, cancel: &CancellationToken) -> std::result::Result<(), BoxError>;

    /// Called with the state of the first page read, then whenever the
    /// subscription reaches the end (`true`) or falls behind again (`false`).
    /// It runs before the page's messages are delivered.
    async fn has_caught_up(&mut self, _caught_up: bool) {}

    /// Called once when the subscription stops.
    async fn subscription_dropped(&mut self, _reason: SubscriptionDroppedReason, _error: Option<BoxError>) {}
}

// =============================================================================
// Handle
// =============================================================================

const NOTHING_DELIVERED: i64 = -1;

#[derive(Debug)]
struct Progress {
    last_version: AtomicI64,
    last_position: AtomicI64,
}

/// Handle to a running subscription. Dropping it stops the subscription.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    stream_id: Option<String>,
    state: watch::Receiver<SubscriptionState>,
    progress: Arc<Progress>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The subscribed stream, `None` for an all-stream subscription.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Version of the last handled message, for stream subscriptions.
    pub fn last_version(&self) -> Option<i32> {
        self.stream_id.as_ref()?;
        let version = self.progress.last_version.load(Ordering::Acquire);
        (version >= 0).then_some(version as i32)
    }

    /// Position of the last handled message.
    pub fn last_position(&self) -> Option<i64> {
        let position = self.progress.last_position.load(Ordering::Acquire);
        (position >= 0).then_some(position)
    }

    /// Resolves once the starting point is known and reading has begun.
    pub async fn started(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s != SubscriptionState::Initializing).await;
    }

    /// Stops the subscription and waits for its loop to finish.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(subscription = %self.name, error = %e, "subscription task failed");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Store Operations
// =============================================================================

/// Where the loop reads next.
#[derive(Debug, Clone)]
enum Cursor {
    Stream { stream_id: String, next_version: i32 },
    All { next_position: i64 },
}

/// One page as the loop sees it.
struct Batch {
    messages: Vec<StreamMessage>,
    is_end: bool,
    next: Cursor,
}

impl<B: StreamStoreBackend> StreamStore<B> {
    /// Subscribes to one stream.
    ///
    /// `continue_after_version` selects the start: `None` replays the whole
    /// stream, `Some(v)` starts after version `v`, and
    /// `Some(StreamVersion::END)` delivers only messages appended from now on.
    ///
    /// Must be called inside a tokio runtime.
    pub fn subscribe_to_stream<H: SubscriptionHandler>(
        &self,
        stream_id: &str,
        continue_after_version: Option<i32>,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        let stream_id = StreamId::new(stream_id)?;
        if matches!(continue_after_version, Some(v) if v < StreamVersion::END) {
            return Err(Error::InvalidArgument(
                "continue_after_version must be >= -1".to_string(),
            ));
        }
        let start = Start::Stream {
            stream_id: stream_id.to_string(),
            after: continue_after_version,
        };
        self.spawn_subscription(Some(stream_id.to_string()), start, handler, options)
    }

    /// Subscribes to every stream.
    ///
    /// `continue_after_position` works like the version of
    /// [`subscribe_to_stream`](Self::subscribe_to_stream), with
    /// `Some(Position::END)` meaning "from now on".
    pub fn subscribe_to_all<H: SubscriptionHandler>(
        &self,
        continue_after_position: Option<i64>,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        if matches!(continue_after_position, Some(p) if p < Position::END) {
            return Err(Error::InvalidArgument(
                "continue_after_position must be >= -1".to_string(),
            ));
        }
        let start = Start::All {
            after: continue_after_position,
        };
        self.spawn_subscription(None, start, handler, options)
    }

    fn spawn_subscription<H: SubscriptionHandler>(
        &self,
        stream_id: Option<String>,
        start: Start,
        handler: H,
        options: SubscriptionOptions,
    ) -> Result<Subscription> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        if options.page_size == 0 {
            return Err(Error::InvalidArgument("page_size must be positive".to_string()));
        }

        let name = options
            .name
            .clone()
            .unwrap_or_else(|| format!("subscription-{}", Uuid::new_v4()));
        let (initial_version, initial_position) = start.initial_progress();
        let progress = Arc::new(Progress {
            last_version: AtomicI64::new(initial_version),
            last_position: AtomicI64::new(initial_position),
        });
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Initializing);
        let cancel = self.inner.shutdown.child_token();

        // Subscribe before the first read so no append falls in between.
        let signals = self.inner.notifier.subscribe();

        let pull = PullLoop {
            store: self.clone(),
            name: name.clone(),
            options,
            progress: Arc::clone(&progress),
            state: state_tx,
            signals,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(pull.run(start, handler));

        info!(subscription = %name, stream = ?stream_id, "subscription started");
        Ok(Subscription {
            name,
            stream_id,
            state: state_rx,
            progress,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }
}

// =============================================================================
// Pull Loop
// =============================================================================

#[derive(Debug, Clone)]
enum Start {
    Stream { stream_id: String, after: Option<i32> },
    All { after: Option<i64> },
}

impl Start {
    fn initial_progress(&self) -> (i64, i64) {
        match self {
            Start::Stream { after: Some(v), .. } => (i64::from(*v).max(NOTHING_DELIVERED), NOTHING_DELIVERED),
            Start::All { after: Some(p) } => (NOTHING_DELIVERED, (*p).max(NOTHING_DELIVERED)),
            _ => (NOTHING_DELIVERED, NOTHING_DELIVERED),
        }
    }
}

struct PullLoop<B: StreamStoreBackend> {
    store: StreamStore<B>,
    name: String,
    options: SubscriptionOptions,
    progress: Arc<Progress>,
    state: watch::Sender<SubscriptionState>,
    signals: broadcast::Receiver<()>,
    cancel: CancellationToken,
}

type Dropped = (SubscriptionDroppedReason, Option<BoxError>);

impl<B: StreamStoreBackend> PullLoop<B> {
    async fn run<H: SubscriptionHandler>(mut self, start: Start, mut handler: H) {
        let (reason, error) = match self.resolve_start(start).await {
            Ok(cursor) => {
                self.state.send_replace(SubscriptionState::CatchingUp);
                self.pull(cursor, &mut handler).await
            }
            Err(e) => self.classify(e),
        };

        self.state.send_replace(SubscriptionState::Disposed);
        match &error {
            Some(e) => warn!(subscription = %self.name, ?reason, error = %e, "subscription dropped"),
            None => info!(subscription = %self.name, ?reason, "subscription dropped"),
        }
        handler.subscription_dropped(reason, error).await;
    }

    /// Turns the requested start into the first cursor to read from.
    async fn resolve_start(&self, start: Start) -> Result<Cursor> {
        match start {
            Start::Stream { stream_id, after: None } => Ok(Cursor::Stream {
                stream_id,
                next_version: StreamVersion::START,
            }),
            Start::Stream {
                stream_id,
                after: Some(StreamVersion::END),
            } => {
                let page = self
                    .store
                    .read_stream_backwards(&stream_id, StreamVersion::END, 1, false, &self.cancel)
                    .await?;
                let next_version = (page.last_stream_version + 1).max(StreamVersion::START);
                Ok(Cursor::Stream { stream_id, next_version })
            }
            Start::Stream {
                stream_id,
                after: Some(v),
            } => Ok(Cursor::Stream {
                stream_id,
                next_version: v + 1,
            }),
            Start::All { after: None } => Ok(Cursor::All {
                next_position: Position::START,
            }),
            Start::All {
                after: Some(Position::END),
            } => {
                let head = self.store.read_head_position(&self.cancel).await?;
                Ok(Cursor::All { next_position: head + 1 })
            }
            Start::All { after: Some(p) } => Ok(Cursor::All { next_position: p + 1 }),
        }
    }

    async fn pull<H: SubscriptionHandler>(&mut self, mut cursor: Cursor, handler: &mut H) -> Dropped {
        let mut caught_up: Option<bool> = None;

        loop {
            if self.cancel.is_cancelled() {
                return (SubscriptionDroppedReason::Disposed, None);
            }

            let batch = match self.read_batch(&cursor).await {
                Ok(batch) => batch,
                Err(e) => return self.classify(e),
            };

            // The first page always reports, later pages only on a change.
            if caught_up != Some(batch.is_end) {
                caught_up = Some(batch.is_end);
                let state = if batch.is_end {
                    SubscriptionState::Live
                } else {
                    SubscriptionState::CatchingUp
                };
                self.state.send_replace(state);
                debug!(subscription = %self.name, caught_up = batch.is_end, "catch-up state changed");
                handler.has_caught_up(batch.is_end).await;
            }

            let was_empty = batch.messages.is_empty();
            for message in batch.messages {
                if self.cancel.is_cancelled() {
                    return (SubscriptionDroppedReason::Disposed, None);
                }
                let (version, position) = (message.stream_version, message.position);
                if let Err(e) = handler.message_received(message, &self.cancel).await {
                    return (SubscriptionDroppedReason::SubscriberError, Some(e));
                }
                self.progress.last_version.store(i64::from(version), Ordering::Release);
                self.progress.last_position.store(position, Ordering::Release);
            }
            cursor = batch.next;

            if batch.is_end && was_empty {
                if let Err(dropped) = self.wait_for_signal().await {
                    return dropped;
                }
            }
        }
    }

    async fn read_batch(&self, cursor: &Cursor) -> Result<Batch> {
        let page_size = self.options.page_size;
        let prefetch = self.options.prefetch;

        match cursor {
            Cursor::Stream { stream_id, next_version } => {
                let page = self
                    .store
                    .read_stream_forwards(stream_id, *next_version, page_size, prefetch, &self.cancel)
                    .await?;
                // A missing stream keeps the cursor where it is.
                let next_version = match page.status {
                    PageReadStatus::Success => page.next_stream_version,
                    _ => *next_version,
                };
                Ok(Batch {
                    messages: page.messages,
                    is_end: page.is_end,
                    next: Cursor::Stream {
                        stream_id: stream_id.clone(),
                        next_version,
                    },
                })
            }
            Cursor::All { next_position } => {
                let page = self
                    .store
                    .read_all_forwards(*next_position, page_size, prefetch, &self.cancel)
                    .await?;
                Ok(Batch {
                    messages: page.messages,
                    is_end: page.is_end,
                    next: Cursor::All {
                        next_position: page.next_position,
                    },
                })
            }
        }
    }

    async fn wait_for_signal(&mut self) -> std::result::Result<(), Dropped> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err((SubscriptionDroppedReason::Disposed, None)),
            signal = self.signals.recv() => match signal {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Ok(()),
                Err(broadcast::error::RecvError::Closed) => Err((SubscriptionDroppedReason::Disposed, None)),
            },
        }
    }

    fn classify(&self, error: Error) -> Dropped {
        // Once cancelled, a failing read is part of shutting down.
        if self.cancel.is_cancelled() {
            return (SubscriptionDroppedReason::Disposed, None);
        }
        match error {
            Error::Disposed => (SubscriptionDroppedReason::Disposed, None),
            e => (SubscriptionDroppedReason::StreamStoreError, Some(Box::new(e))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
