//! # Storage Backends
//!
//! A backend persists streams and the global log. It knows nothing about
//! metadata, retention, notifications or subscriptions; those live in the
//! [`StreamStore`](crate::StreamStore) engine, which drives a backend through
//! the [`StreamStoreBackend`] trait.
//!
//! ```text
//!                StreamStore (reader / writer / subscriptions)
//!                              │
//!                   StreamStoreBackend trait
//!                 ┌────────────┴────────────┐
//!                 ▼                         ▼
//!          InMemoryBackend            SqliteBackend
//!          (RwLock<state>)        (actor thread + SQLite)
//! ```
//!
//! ## Contract
//!
//! - `append` is atomic: the whole batch is written with contiguous versions and
//!   increasing positions, or nothing is. The expected-version decision is taken
//!   with [`plan_append`](crate::concurrency::plan_append) while the backend
//!   holds the stream exclusively.
//! - Reads return raw slices: at most `limit` messages starting at `start`
//!   (inclusive) in the requested direction. A negative `start` on a backward
//!   read means "from the head". Page shaping happens in the engine.
//! - Deletions carry their tombstones. Removing data and recording the
//!   tombstone in `$deleted` is one atomic step.
//! - A backend observes the cancellation token before committing and returns
//!   `Error::Cancelled` with nothing written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::concurrency::StreamHead;
use crate::error::{Error, Result};
use crate::stream_id::StreamKey;
use crate::types::{
    AppendResult, ExpectedVersion, JsonDataLoader, ListStreamsPage, NewStreamMessage, Pattern,
    ReadDirection, StreamMessage,
};

// =============================================================================
// Stored Records
// =============================================================================

/// A message as a backend holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// The user-facing stream id.
    pub stream_id: String,
    pub message_id: Uuid,
    pub stream_version: i32,
    pub position: i64,
    pub created_utc: DateTime<Utc>,
    pub message_type: String,
    pub json_data: String,
    pub json_metadata: String,
}

impl StoredMessage {
    /// Converts into a read result, with the body inline or behind `loader`.
    pub fn into_message(self, loader: Option<JsonDataLoader>) -> StreamMessage {
        match loader {
            None => StreamMessage::prefetched(
                self.stream_id,
                self.message_id,
                self.stream_version,
                self.position,
                self.created_utc,
                self.message_type,
                self.json_metadata,
                self.json_data,
            ),
            Some(loader) => StreamMessage::deferred(
                self.stream_id,
                self.message_id,
                self.stream_version,
                self.position,
                self.created_utc,
                self.message_type,
                self.json_metadata,
                loader,
            ),
        }
    }
}

/// Result of a backend append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub result: AppendResult,
    /// False when the batch was an idempotent replay and nothing was written.
    pub appended: bool,
}

/// A whole-stream deletion.
///
/// The backend applies it in one atomic step: the stream and its metadata
/// stream are removed and, if the stream existed, `tombstone` is appended to
/// `$deleted`. Either all of it is durable or none of it is.
#[derive(Debug, Clone)]
pub struct StreamDeletion {
    pub key: StreamKey,
    pub metadata_key: StreamKey,
    pub expected_version: ExpectedVersion,
    pub tombstone: NewStreamMessage,
}

/// One message to delete and the tombstone recorded if it was present.
#[derive(Debug, Clone)]
pub struct MessageDeletion {
    pub message_id: Uuid,
    pub tombstone: NewStreamMessage,
}

/// A raw slice of one stream plus its head.
#[derive(Debug, Clone)]
pub struct StreamSlice {
    pub head: StreamHead,
    pub messages: Vec<StreamMessage>,
}

// =============================================================================
// Backend Trait
// =============================================================================

#[async_trait]
pub trait StreamStoreBackend: Send + Sync + 'static {
    /// Appends `messages` under the expected-version rules.
    async fn append(
        &self,
        key: &StreamKey,
        expected_version: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome>;

    /// Reads up to `limit` messages of one stream. `None` if the stream does not exist.
    async fn read_stream(
        &self,
        key: &StreamKey,
        start: i32,
        limit: usize,
        direction: ReadDirection,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamSlice>>;

    /// Reads up to `limit` messages of the global log.
    async fn read_all(
        &self,
        start: i64,
        limit: usize,
        direction: ReadDirection,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamMessage>>;

    /// Applies a [`StreamDeletion`]. Returns false if the stream did not exist,
    /// in which case no tombstone is written.
    async fn delete_stream(
        &self,
        deletion: StreamDeletion,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Removes the given messages and appends the tombstones of those that
    /// were present, atomically. Returns the ids that were removed.
    async fn delete_messages(
        &self,
        key: &StreamKey,
        deletions: Vec<MessageDeletion>,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>>;

    /// Highest position in the store, -1 when empty.
    async fn read_head_position(&self, cancel: &CancellationToken) -> Result<i64>;

    /// Head of one stream, `None` if it does not exist.
    async fn read_stream_head(&self, key: &StreamKey, cancel: &CancellationToken) -> Result<Option<StreamHead>>;

    /// One page of stream ids matching `pattern`, in creation order.
    async fn list_streams(
        &self,
        pattern: &Pattern,
        max_count: usize,
        continuation_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ListStreamsPage>;

    /// Releases background resources. Called once when the store is disposed.
    async fn shutdown(&self) {}
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Fails fast if the operation was cancelled.
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Decodes a list-streams continuation token.
///
/// Both backends use the same token shape: the decimal cursor after which the
/// next page starts. A missing or empty token starts from the beginning.
pub(crate) fn parse_continuation(token: Option<&str>) -> Result<i64> {
    match token {
        None => Ok(-1),
        Some(t) if t.is_empty() => Ok(-1),
        Some(t) => t
            .parse::<i64>()
            .map_err(|_| Error::InvalidArgument(format!("'{}' is not a valid continuation token", t))),
    }
}
