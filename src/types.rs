//! # Domain Types for the Stream Store
//!
//! This module defines the types that cross the public API: messages, versions,
//! positions, read pages and write results.
//!
//! ## Versions and Positions
//!
//! ```text
//!   stream "order-1"        stream "user-7"
//!   version 0  ──┐          version 0 ──┐
//!   version 1  ──┼──┐                   │
//!                │  │                   │
//!   global log:  ▼  │                   ▼
//!   position     0  │   1               2      3 ...
//!                   └───────────────────────►  ▲
//!                                              │
//!                               version 1 of "order-1"
//! ```
//!
//! - `StreamVersion` is dense and 0-based within one stream.
//! - `Position` is store-global and strictly increasing, but readers may see
//!   transient holes while concurrent transactions are in flight.
//!
//! Both are plain integers with `-1` reserved as the "end" sentinel, which is
//! why they are `i32`/`i64` instead of unsigned newtypes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Reserved Names
// =============================================================================

/// Prefix reserved for system streams.
pub const RESERVED_PREFIX: &str = "$";

/// Prefix of the metadata stream that shadows every stream.
pub const METADATA_STREAM_PREFIX: &str = "$$";

/// The stream that receives deletion tombstones.
pub const DELETED_STREAM_ID: &str = "$deleted";

/// Message type of a stream deletion tombstone.
pub const STREAM_DELETED_MESSAGE_TYPE: &str = "$stream-deleted";

/// Message type of a single message deletion tombstone.
pub const MESSAGE_DELETED_MESSAGE_TYPE: &str = "$message-deleted";

/// Message type of a stream metadata record.
pub const METADATA_MESSAGE_TYPE: &str = "$stream-metadata";

// =============================================================================
// Sentinels
// =============================================================================

/// Well-known stream versions.
pub struct StreamVersion;

impl StreamVersion {
    /// The first version of any stream.
    pub const START: i32 = 0;

    /// "The last message in the stream" for backward reads and subscriptions.
    pub const END: i32 = -1;
}

/// Well-known global positions.
pub struct Position;

impl Position {
    /// The first position of the store.
    pub const START: i64 = 0;

    /// "The head of the store" for backward reads and subscriptions.
    pub const END: i64 = -1;
}

// =============================================================================
// Expected Version
// =============================================================================

/// Concurrency-control token supplied by a writer.
///
/// | Variant | Raw | Meaning |
/// |---------|-----|---------|
/// | `Any` | -2 | No check; duplicate ids are absorbed idempotently |
/// | `NoStream` | -1 | The stream must not exist yet |
/// | `EmptyStream` | -3 | The stream may exist but must hold no live messages |
/// | `Exact(n)` | n | The stream's last version must be `n` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedVersion {
    Any,
    NoStream,
    EmptyStream,
    Exact(i32),
}

impl ExpectedVersion {
    pub const ANY_RAW: i32 = -2;
    pub const NO_STREAM_RAW: i32 = -1;
    pub const EMPTY_STREAM_RAW: i32 = -3;

    /// Decodes the integer form used on the wire and in storage.
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            Self::ANY_RAW => Ok(ExpectedVersion::Any),
            Self::NO_STREAM_RAW => Ok(ExpectedVersion::NoStream),
            Self::EMPTY_STREAM_RAW => Ok(ExpectedVersion::EmptyStream),
            v if v >= 0 => Ok(ExpectedVersion::Exact(v)),
            v => Err(Error::InvalidArgument(format!("{} is not a valid expected version", v))),
        }
    }

    /// Returns the integer form.
    pub fn as_raw(&self) -> i32 {
        match self {
            ExpectedVersion::Any => Self::ANY_RAW,
            ExpectedVersion::NoStream => Self::NO_STREAM_RAW,
            ExpectedVersion::EmptyStream => Self::EMPTY_STREAM_RAW,
            ExpectedVersion::Exact(v) => *v,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "Any"),
            ExpectedVersion::NoStream => write!(f, "NoStream"),
            ExpectedVersion::EmptyStream => write!(f, "EmptyStream"),
            ExpectedVersion::Exact(v) => write!(f, "{}", v),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A message to be appended.
///
/// The `message_id` is supplied by the client and is what makes appends
/// idempotent: re-sending the same ids in the same order is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStreamMessage {
    pub message_id: Uuid,
    pub message_type: String,
    pub json_data: String,
    pub json_metadata: String,
}

impl NewStreamMessage {
    /// Creates a message with empty JSON metadata.
    pub fn new(message_id: Uuid, message_type: impl Into<String>, json_data: impl Into<String>) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            json_data: json_data.into(),
            json_metadata: String::new(),
        }
    }

    /// Sets the JSON metadata.
    pub fn with_metadata(mut self, json_metadata: impl Into<String>) -> Self {
        self.json_metadata = json_metadata.into();
        self
    }
}

/// Deferred loader for a message body that was not prefetched.
///
/// Resolves to `None` when the message has been deleted since the page was read.
pub type JsonDataLoader = Arc<dyn Fn() -> BoxFuture<'static, Result<Option<String>>> + Send + Sync>;

#[derive(Clone)]
enum JsonData {
    Prefetched(String),
    Deferred(JsonDataLoader),
}

/// A message as read back from the store.
#[derive(Clone)]
pub struct StreamMessage {
    /// The user-facing stream id (never the hashed key).
    pub stream_id: String,
    pub message_id: Uuid,
    pub stream_version: i32,
    pub position: i64,
    pub created_utc: DateTime<Utc>,
    pub message_type: String,
    pub json_metadata: String,
    json_data: JsonData,
}

impl StreamMessage {
    /// Creates a message whose body is already loaded.
    #[allow(clippy::too_many_arguments)]
    pub fn prefetched(
        stream_id: impl Into<String>,
        message_id: Uuid,
        stream_version: i32,
        position: i64,
        created_utc: DateTime<Utc>,
        message_type: impl Into<String>,
        json_metadata: impl Into<String>,
        json_data: impl Into<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            message_id,
            stream_version,
            position,
            created_utc,
            message_type: message_type.into(),
            json_metadata: json_metadata.into(),
            json_data: JsonData::Prefetched(json_data.into()),
        }
    }

    /// Creates a message whose body is fetched on demand.
    #[allow(clippy::too_many_arguments)]
    pub fn deferred(
        stream_id: impl Into<String>,
        message_id: Uuid,
        stream_version: i32,
        position: i64,
        created_utc: DateTime<Utc>,
        message_type: impl Into<String>,
        json_metadata: impl Into<String>,
        loader: JsonDataLoader,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            message_id,
            stream_version,
            position,
            created_utc,
            message_type: message_type.into(),
            json_metadata: json_metadata.into(),
            json_data: JsonData::Deferred(loader),
        }
    }

    /// Returns the body if it was prefetched.
    pub fn prefetched_json_data(&self) -> Option<&str> {
        match &self.json_data {
            JsonData::Prefetched(data) => Some(data),
            JsonData::Deferred(_) => None,
        }
    }

    /// Returns the body, loading it from the backend when it was not prefetched.
    pub async fn json_data(&self) -> Result<Option<String>> {
        match &self.json_data {
            JsonData::Prefetched(data) => Ok(Some(data.clone())),
            JsonData::Deferred(loader) => loader().await,
        }
    }
}

impl fmt::Debug for StreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMessage")
            .field("stream_id", &self.stream_id)
            .field("message_id", &self.message_id)
            .field("stream_version", &self.stream_version)
            .field("position", &self.position)
            .field("created_utc", &self.created_utc)
            .field("message_type", &self.message_type)
            .field("prefetched", &self.prefetched_json_data().is_some())
            .finish()
    }
}

// =============================================================================
// Read Pages
// =============================================================================

/// Direction of a paged read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// Outcome of a per-stream read. Not an error: callers branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

/// One page of a per-stream read.
#[derive(Debug, Clone)]
pub struct ReadStreamPage {
    pub stream_id: String,
    pub status: PageReadStatus,
    pub from_stream_version: i32,
    /// Where the next page in the same direction starts.
    pub next_stream_version: i32,
    /// The stream's head version, or -1 when it does not exist.
    pub last_stream_version: i32,
    /// The position of the stream's head message, or -1.
    pub last_stream_position: i64,
    pub direction: ReadDirection,
    /// No more messages are currently available in this direction.
    pub is_end: bool,
    pub messages: Vec<StreamMessage>,
}

impl ReadStreamPage {
    /// A page for a stream that does not exist.
    pub fn not_found(stream_id: impl Into<String>, from_stream_version: i32, direction: ReadDirection) -> Self {
        Self {
            stream_id: stream_id.into(),
            status: PageReadStatus::StreamNotFound,
            from_stream_version,
            next_stream_version: StreamVersion::END,
            last_stream_version: StreamVersion::END,
            last_stream_position: Position::END,
            direction,
            is_end: true,
            messages: Vec::new(),
        }
    }
}

/// One page of a read over the global log.
#[derive(Debug, Clone)]
pub struct ReadAllPage {
    pub from_position: i64,
    /// Where the next page in the same direction starts (inclusive).
    pub next_position: i64,
    pub is_end: bool,
    pub direction: ReadDirection,
    pub messages: Vec<StreamMessage>,
}

// =============================================================================
// Write Results
// =============================================================================

/// State of the stream after an append (or the existing state for an
/// idempotent replay).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub current_version: i32,
    pub current_position: i64,
}

impl AppendResult {
    pub fn new(current_version: i32, current_position: i64) -> Self {
        Self {
            current_version,
            current_position,
        }
    }
}

/// The current retention policy and metadata of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadataResult {
    pub stream_id: String,
    /// Version of the `$$` metadata stream, -1 when no metadata was ever set.
    pub metadata_stream_version: i32,
    /// Max age in seconds.
    pub max_age: Option<i32>,
    pub max_count: Option<i32>,
    pub metadata_json: Option<String>,
}

impl StreamMetadataResult {
    /// The result for a stream without metadata.
    pub fn none(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            metadata_stream_version: StreamVersion::END,
            max_age: None,
            max_count: None,
            metadata_json: None,
        }
    }
}

// =============================================================================
// Stream Listing
// =============================================================================

/// Filter applied by `list_streams`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    StartingWith(String),
    EndingWith(String),
}

impl Pattern {
    /// Returns true if `stream_id` passes the filter.
    pub fn matches(&self, stream_id: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::StartingWith(prefix) => stream_id.starts_with(prefix.as_str()),
            Pattern::EndingWith(suffix) => stream_id.ends_with(suffix.as_str()),
        }
    }
}

/// One page of stream ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListStreamsPage {
    pub stream_ids: Vec<String>,
    /// Opaque token to pass back for the next page.
    pub continuation_token: String,
}

// =============================================================================
// Tests
// =============================================================================
