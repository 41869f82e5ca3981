//! # StreamStore: the Public Handle
//!
//! [`StreamStore`] wraps a [`StreamStoreBackend`] with everything that is not
//! storage: argument validation, retention (max age and max count), deletion
//! tombstones, append notifications, catch-up subscriptions and disposal.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                         StreamStore<B> (Clone)                      │
//! │                                                                     │
//! │  reader.rs        writer.rs         metadata.rs     subscription.rs │
//! │  read pages       append + retry    $$ streams      pull loops      │
//! │  gap reload       delete + $deleted max-age cache                   │
//! │  expiry filter    max-count scavenge                                │
//! │        │                 │                │               │         │
//! │        └────────┬────────┴────────┬───────┘               │         │
//! │                 ▼                 ▼                       ▼         │
//! │            backend: B        task queue              notifier       │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! A store must be created inside a tokio runtime: it starts a background task
//! queue and, for polling notifications, a polling task. [`StreamStore::dispose`]
//! stops both, drops every subscription and shuts the backend down. It is
//! idempotent. Afterwards every operation returns `Error::Disposed`.
//!
//! ## Cancellation
//!
//! Every operation takes a `CancellationToken`. It is checked on entry and by
//! the backend before it commits; a cancelled write leaves nothing behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{ensure_not_cancelled, StreamStoreBackend};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::metadata::MetadataMaxAgeCache;
use crate::notifier::{NotifierKind, PollingNotifier, PushNotifier, StreamStoreNotifier};
use crate::stream_id::StreamId;
use crate::task_queue::TaskQueue;
use crate::types::{ListStreamsPage, Pattern, Position, StreamVersion};

// =============================================================================
// Configuration
// =============================================================================

/// Default lifetime of a cached max age, in seconds.
pub const DEFAULT_METADATA_CACHE_EXPIRY_SECS: u64 = 60;

/// Default number of streams whose max age is cached.
pub const DEFAULT_METADATA_CACHE_MAX_SIZE: usize = 10_000;

/// Default pause before re-reading a page that shows a position gap.
pub const DEFAULT_GAP_RELOAD_INTERVAL_MS: u64 = 3000;

/// Default number of retries for an append that hit a transient backend error.
pub const DEFAULT_APPEND_RETRIES: u32 = 2;

/// Where max-count scavenging runs after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScavengeMode {
    /// Inside the append call, before it returns.
    #[default]
    Inline,
    /// On the background task queue.
    Background,
}

/// Tunables of a [`StreamStore`].
#[derive(Debug, Clone)]
pub struct StreamStoreSettings {
    /// How long a cached max age stays valid.
    pub metadata_cache_expiry: Duration,

    /// How many streams the max-age cache holds.
    pub metadata_cache_max_size: usize,

    /// Pause before re-reading a forward page of the global log whose
    /// positions are not contiguous.
    pub gap_reload_interval: Duration,

    /// Retries for appends that fail with a transient backend error.
    pub append_retries: u32,

    /// Source of append signals for subscriptions.
    pub notifier: NotifierKind,

    /// Where max-count scavenging runs.
    pub scavenge_mode: ScavengeMode,
}

impl Default for StreamStoreSettings {
    fn default() -> Self {
        Self {
            metadata_cache_expiry: Duration::from_secs(DEFAULT_METADATA_CACHE_EXPIRY_SECS),
            metadata_cache_max_size: DEFAULT_METADATA_CACHE_MAX_SIZE,
            gap_reload_interval: Duration::from_millis(DEFAULT_GAP_RELOAD_INTERVAL_MS),
            append_retries: DEFAULT_APPEND_RETRIES,
            notifier: NotifierKind::Push,
            scavenge_mode: ScavengeMode::Inline,
        }
    }
}

// =============================================================================
// StreamStore
// =============================================================================

pub(crate) struct Inner<B> {
    pub(crate) backend: Arc<B>,
    pub(crate) settings: StreamStoreSettings,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cache: MetadataMaxAgeCache,
    pub(crate) notifier: Arc<dyn StreamStoreNotifier>,
    pub(crate) tasks: TaskQueue,
    /// Cancelled on dispose. Subscriptions and background work hang off it.
    pub(crate) shutdown: CancellationToken,
    disposed: AtomicBool,
}

/// The stream store. Cloning is cheap and shares the same store.
pub struct StreamStore<B: StreamStoreBackend> {
    pub(crate) inner: Arc<Inner<B>>,
}

impl<B: StreamStoreBackend> Clone for StreamStore<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: StreamStoreBackend> std::fmt::Debug for StreamStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStore")
            .field("settings", &self.inner.settings)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl<B: StreamStoreBackend> StreamStore<B> {
    /// Creates a store with default settings.
    pub fn new(backend: B) -> Self {
        Self::with_settings(backend, StreamStoreSettings::default())
    }

    pub fn with_settings(backend: B, settings: StreamStoreSettings) -> Self {
        Self::with_clock(backend, settings, Arc::new(SystemClock))
    }

    /// Creates a store that takes time from `clock` for timestamps and expiry.
    pub fn with_clock(backend: B, settings: StreamStoreSettings, clock: Arc<dyn Clock>) -> Self {
        let backend = Arc::new(backend);
        let shutdown = CancellationToken::new();

        let notifier: Arc<dyn StreamStoreNotifier> = match settings.notifier {
            NotifierKind::Push => Arc::new(PushNotifier::new()),
            NotifierKind::Polling(interval) => {
                let polled = Arc::clone(&backend);
                let poll_cancel = shutdown.child_token();
                Arc::new(PollingNotifier::spawn(
                    interval,
                    move || {
                        let backend = Arc::clone(&polled);
                        let cancel = poll_cancel.clone();
                        async move { backend.read_head_position(&cancel).await }
                    },
                    shutdown.child_token(),
                ))
            }
        };

        let cache = MetadataMaxAgeCache::new(
            settings.metadata_cache_expiry,
            settings.metadata_cache_max_size,
            Arc::clone(&clock),
        );

        info!(notifier = ?settings.notifier, scavenge = ?settings.scavenge_mode, "stream store opened");

        Self {
            inner: Arc::new(Inner {
                backend,
                tasks: TaskQueue::new(shutdown.child_token()),
                settings,
                clock,
                cache,
                notifier,
                shutdown,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The backend this store runs on.
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn settings(&self) -> &StreamStoreSettings {
        &self.inner.settings
    }

    /// The max-age cache, for inspecting hit and miss counters.
    pub fn metadata_cache(&self) -> &MetadataMaxAgeCache {
        &self.inner.cache
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Fails with `Disposed` or `Cancelled` before any work starts.
    pub(crate) fn check_usable(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        ensure_not_cancelled(cancel)
    }

    /// Tells subscriptions that messages were written.
    pub(crate) fn signal_appended(&self) {
        self.inner.notifier.notify_appended();
    }

    // =========================================================================
    // Heads and Counts
    // =========================================================================

    /// Highest position in the store, -1 when it is empty.
    pub async fn read_head_position(&self, cancel: &CancellationToken) -> Result<i64> {
        self.check_usable(cancel)?;
        self.inner.backend.read_head_position(cancel).await
    }

    /// Last version of `stream_id`, -1 if it does not exist.
    pub async fn read_stream_head_version(&self, stream_id: &str, cancel: &CancellationToken) -> Result<i32> {
        self.check_usable(cancel)?;
        let stream_id = StreamId::new(stream_id)?;
        let head = self.inner.backend.read_stream_head(&stream_id.key(), cancel).await?;
        Ok(head.map_or(StreamVersion::END, |h| h.last_version))
    }

    /// Position of the last message of `stream_id`, -1 if it does not exist.
    pub async fn read_stream_head_position(&self, stream_id: &str, cancel: &CancellationToken) -> Result<i64> {
        self.check_usable(cancel)?;
        let stream_id = StreamId::new(stream_id)?;
        let head = self.inner.backend.read_stream_head(&stream_id.key(), cancel).await?;
        Ok(head.map_or(Position::END, |h| h.last_position))
    }

    /// Number of messages still stored in `stream_id`, 0 if it does not exist.
    pub async fn get_stream_message_count(&self, stream_id: &str, cancel: &CancellationToken) -> Result<usize> {
        self.check_usable(cancel)?;
        let stream_id = StreamId::new(stream_id)?;
        let head = self.inner.backend.read_stream_head(&stream_id.key(), cancel).await?;
        Ok(head.map_or(0, |h| h.live_count))
    }

    /// Lists stream ids in creation order, `max_count` at a time.
    ///
    /// Pass the returned token back to continue; an empty token means there
    /// are no more pages.
    pub async fn list_streams(
        &self,
        pattern: Pattern,
        max_count: usize,
        continuation_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ListStreamsPage> {
        self.check_usable(cancel)?;
        if max_count == 0 {
            return Err(Error::InvalidArgument("max_count must be positive".to_string()));
        }
        self.inner
            .backend
            .list_streams(&pattern, max_count, continuation_token, cancel)
            .await
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Stops background work, drops all subscriptions and shuts the backend down.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("disposing stream store");

        self.inner.shutdown.cancel();
        self.inner.tasks.shutdown().await;
        self.inner.backend.shutdown().await;

        info!("stream store disposed");
    }
}

// =============================================================================
// Tests
// =============================================================================
