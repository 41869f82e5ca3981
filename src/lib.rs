//! # streamstore - Append-Only Multi-Stream Event Store
//!
//! streamstore keeps ordered streams of JSON messages plus one global log
//! across all of them. It provides:
//!
//! - **Optimistic concurrency**: appends carry an expected version
//! - **Idempotent appends**: re-sending a stored batch is a no-op
//! - **Paged reads**: per stream or over the global log, both directions
//! - **Retention**: per-stream `MaxAge` and `MaxCount` kept in metadata streams
//! - **Catch-up subscriptions**: replay history, then follow new appends
//! - **Pluggable storage**: in-memory or SQLite
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        StreamStore<B>                           │
//! │   writer (append, delete, scavenge)   reader (pages, expiry)    │
//! │   metadata (+ max-age cache)          subscription (pull loop)  │
//! │   notifier (push / polling)           task queue (background)   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ StreamStoreBackend
//!               ┌───────────────┴───────────────┐
//!               ▼                               ▼
//! ┌──────────────────────────┐    ┌──────────────────────────────────┐
//! │     InMemoryBackend      │    │          SqliteBackend           │
//! │  tokio RwLock + BTreeMap │    │  actor thread ──► SqliteStorage  │
//! └──────────────────────────┘    └──────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Dense versions**: a stream's versions are 0, 1, 2, ... as written
//! 2. **Monotonic positions**: a position is never reused, even after deletes
//! 3. **Atomic batches**: an append writes all of its messages or none
//! 4. **One conflict signal**: every expected-version violation is
//!    `Error::WrongExpectedVersion`
//!
//! ## Example
//!
//! ```rust,no_run
//! use streamstore::{ExpectedVersion, InMemoryBackend, NewStreamMessage, StreamStore};
//! use tokio_util::sync::CancellationToken;
//! use uuid::Uuid;
//!
//! # async fn example() -> streamstore::Result<()> {
//! let store = StreamStore::new(InMemoryBackend::new());
//! let cancel = CancellationToken::new();
//!
//! let message = NewStreamMessage::new(Uuid::new_v4(), "order-placed", r#"{"total":10}"#);
//! store
//!     .append_to_stream("order-1", ExpectedVersion::NoStream, vec![message], &cancel)
//!     .await?;
//!
//! let page = store.read_stream_forwards("order-1", 0, 10, true, &cancel).await?;
//! assert_eq!(page.messages.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error type
//! - [`types`]: messages, versions, pages and results
//! - [`stream_id`]: stream id validation and storage keys
//! - [`concurrency`]: the expected-version rules shared by all backends
//! - [`backend`]: the storage trait
//! - [`memory`], [`schema`], [`storage`], [`actor`]: the two backends
//! - [`api`]: [`StreamStore`] and its settings

/// Error types for stream store operations.
pub mod error;

/// Domain types shared by the API and the backends.
pub mod types;

/// Stream id validation and hashing into storage keys.
pub mod stream_id;

/// Injectable time source.
pub mod clock;

/// JSON payloads of system messages.
pub mod codec;

/// Expected-version checks and idempotent replay detection.
pub mod concurrency;

/// The storage backend trait.
pub mod backend;

/// In-memory backend.
pub mod memory;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Synchronous SQLite storage operations.
pub mod storage;

/// SQLite backend running on a dedicated thread.
pub mod actor;

/// Stream metadata operations and the max-age cache.
pub mod metadata;

/// Serial background job queue.
pub mod task_queue;

/// Append notifications for subscriptions.
pub mod notifier;

/// The [`StreamStore`] handle, settings, heads and disposal.
///
/// The store's operations are split by concern across [`reader`], [`writer`],
/// [`metadata`] and [`subscription`].
pub mod api;

/// Paged reads and max-age filtering.
pub mod reader;

/// Appends, deletions and max-count scavenging.
pub mod writer;

/// Catch-up subscriptions.
pub mod subscription;

// =============================================================================
// Re-exports
// =============================================================================

pub use actor::SqliteBackend;
pub use api::{ScavengeMode, StreamStore, StreamStoreSettings};
pub use backend::StreamStoreBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use memory::InMemoryBackend;
pub use notifier::NotifierKind;
pub use schema::Database;
pub use stream_id::StreamId;

pub use types::{
    AppendResult, ExpectedVersion, ListStreamsPage, NewStreamMessage, PageReadStatus, Pattern, Position,
    ReadAllPage, ReadDirection, ReadStreamPage, StreamMessage, StreamMetadataResult, StreamVersion,
    DELETED_STREAM_ID, MESSAGE_DELETED_MESSAGE_TYPE, METADATA_MESSAGE_TYPE, STREAM_DELETED_MESSAGE_TYPE,
};

pub use subscription::{
    BoxError, Subscription, SubscriptionDroppedReason, SubscriptionHandler, SubscriptionOptions,
    SubscriptionState,
};
