//! # In-Memory Backend
//!
//! A complete backend held in process memory. It is the reference the SQLite
//! backend is tested against and the backend of choice for unit tests.
//!
//! ## Layout
//!
//! ```text
//! streams:  key ──► MemoryStream { messages: version ──► StoredMessage,
//!                                  by_id:    message id ──► version }
//! all:      position ──► (key, version)        global log index
//! order:    creation seq ──► key               list_streams cursor
//! ```
//!
//! All operations take one `tokio::sync::RwLock`; writes are serialized,
//! reads run concurrently. Positions come from a counter that never goes
//! backward, so deleted positions are never reused.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{
    ensure_not_cancelled, parse_continuation, AppendOutcome, MessageDeletion, StoredMessage, StreamDeletion,
    StreamSlice, StreamStoreBackend,
};
use crate::concurrency::{check_delete, plan_append, AppendPlan, AppendTarget, StreamHead};
use crate::error::Result;
use crate::stream_id::StreamKey;
use crate::types::{
    AppendResult, ExpectedVersion, JsonDataLoader, ListStreamsPage, NewStreamMessage, Pattern,
    ReadDirection, StreamMessage, DELETED_STREAM_ID,
};

// =============================================================================
// State
// =============================================================================

#[derive(Debug)]
struct MemoryStream {
    original_id: String,
    seq: i64,
    messages: BTreeMap<i32, StoredMessage>,
    by_id: HashMap<Uuid, i32>,
    last_version: i32,
    last_position: i64,
}

impl MemoryStream {
    fn head(&self) -> StreamHead {
        StreamHead {
            last_version: self.last_version,
            last_position: self.last_position,
            live_count: self.messages.len(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    streams: HashMap<String, MemoryStream>,
    all: BTreeMap<i64, (String, i32)>,
    order: BTreeMap<i64, String>,
    next_position: i64,
    next_seq: i64,
}

impl MemoryState {
    fn lookup(&self, position: i64) -> Option<&StoredMessage> {
        let (key, version) = self.all.get(&position)?;
        self.streams.get(key)?.messages.get(version)
    }

    fn contains(&self, key: &str, message_id: Uuid) -> bool {
        self.streams.get(key).is_some_and(|s| s.by_id.contains_key(&message_id))
    }

    /// Runs the expected-version rules against the current state.
    fn plan(&self, key: &StreamKey, expected_version: ExpectedVersion, messages: &[NewStreamMessage]) -> Result<AppendPlan> {
        plan_append(
            key.original(),
            expected_version,
            messages,
            &mut MemoryTarget(self.streams.get(key.id())),
        )
    }

    /// Writes a planned batch after the stream head.
    fn write(
        &mut self,
        key: &StreamKey,
        create_stream: bool,
        messages: Vec<NewStreamMessage>,
        created_utc: DateTime<Utc>,
    ) -> AppendResult {
        if create_stream {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.order.insert(seq, key.id().to_string());
            self.streams.insert(
                key.id().to_string(),
                MemoryStream {
                    original_id: key.original().to_string(),
                    seq,
                    messages: BTreeMap::new(),
                    by_id: HashMap::new(),
                    last_version: -1,
                    last_position: -1,
                },
            );
        }

        let Some(stream) = self.streams.get_mut(key.id()) else {
            return AppendResult::new(-1, -1);
        };

        for message in messages {
            let version = stream.last_version + 1;
            let position = self.next_position;
            self.next_position += 1;

            stream.by_id.insert(message.message_id, version);
            stream.messages.insert(
                version,
                StoredMessage {
                    stream_id: stream.original_id.clone(),
                    message_id: message.message_id,
                    stream_version: version,
                    position,
                    created_utc,
                    message_type: message.message_type,
                    json_data: message.json_data,
                    json_metadata: message.json_metadata,
                },
            );
            self.all.insert(position, (key.id().to_string(), version));
            stream.last_version = version;
            stream.last_position = position;
        }

        AppendResult::new(stream.last_version, stream.last_position)
    }

    fn remove_stream(&mut self, key: &str) {
        if let Some(stream) = self.streams.remove(key) {
            self.order.remove(&stream.seq);
            for message in stream.messages.values() {
                self.all.remove(&message.position);
            }
        }
    }

    fn remove_message(&mut self, key: &str, message_id: Uuid) -> bool {
        let Some(stream) = self.streams.get_mut(key) else {
            return false;
        };
        let Some(version) = stream.by_id.remove(&message_id) else {
            return false;
        };
        if let Some(message) = stream.messages.remove(&version) {
            self.all.remove(&message.position);
        }
        true
    }
}

/// View of one (possibly missing) stream handed to the append protocol.
struct MemoryTarget<'a>(Option<&'a MemoryStream>);

impl AppendTarget for MemoryTarget<'_> {
    fn head(&mut self) -> Result<Option<StreamHead>> {
        Ok(self.0.map(MemoryStream::head))
    }

    fn find_version(&mut self, message_id: Uuid) -> Result<Option<i32>> {
        Ok(self.0.and_then(|s| s.by_id.get(&message_id).copied()))
    }

    fn read_from(&mut self, from_version: i32, count: usize) -> Result<Vec<StoredMessage>> {
        Ok(self
            .0
            .map(|s| s.messages.range(from_version..).take(count).map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Process-local backend. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn loader(&self, key: &str, message: &StoredMessage) -> JsonDataLoader {
        let state = Arc::clone(&self.state);
        let key = key.to_string();
        let version = message.stream_version;
        let message_id = message.message_id;

        Arc::new(move || {
            let state = Arc::clone(&state);
            let key = key.clone();
            async move {
                let state = state.read().await;
                Ok(state
                    .streams
                    .get(&key)
                    .and_then(|s| s.messages.get(&version))
                    .filter(|m| m.message_id == message_id)
                    .map(|m| m.json_data.clone()))
            }
            .boxed()
        })
    }

    fn to_message(&self, key: &str, stored: &StoredMessage, prefetch: bool) -> StreamMessage {
        let loader = (!prefetch).then(|| self.loader(key, stored));
        stored.clone().into_message(loader)
    }
}

#[async_trait]
impl StreamStoreBackend for InMemoryBackend {
    async fn append(
        &self,
        key: &StreamKey,
        expected_version: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome> {
        let mut state = self.state.write().await;

        let create_stream = match state.plan(key, expected_version, &messages)? {
            AppendPlan::Replay(result) => {
                return Ok(AppendOutcome {
                    result,
                    appended: false,
                })
            }
            AppendPlan::Write { create_stream } => create_stream,
        };

        ensure_not_cancelled(cancel)?;

        let appended = !messages.is_empty();
        let result = state.write(key, create_stream, messages, created_utc);
        debug!(stream = %key, version = result.current_version, "appended in memory");

        Ok(AppendOutcome { result, appended })
    }

    async fn read_stream(
        &self,
        key: &StreamKey,
        start: i32,
        limit: usize,
        direction: ReadDirection,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamSlice>> {
        ensure_not_cancelled(cancel)?;
        let state = self.state.read().await;
        let Some(stream) = state.streams.get(key.id()) else {
            return Ok(None);
        };

        let stored: Vec<&StoredMessage> = match direction {
            ReadDirection::Forward => stream.messages.range(start.max(0)..).take(limit).map(|(_, m)| m).collect(),
            ReadDirection::Backward => {
                let upper = if start < 0 { i32::MAX } else { start };
                stream.messages.range(..=upper).rev().take(limit).map(|(_, m)| m).collect()
            }
        };

        Ok(Some(StreamSlice {
            head: stream.head(),
            messages: stored.into_iter().map(|m| self.to_message(key.id(), m, prefetch)).collect(),
        }))
    }

    async fn read_all(
        &self,
        start: i64,
        limit: usize,
        direction: ReadDirection,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamMessage>> {
        ensure_not_cancelled(cancel)?;
        let state = self.state.read().await;

        let positions: Vec<i64> = match direction {
            ReadDirection::Forward => state.all.range(start.max(0)..).take(limit).map(|(p, _)| *p).collect(),
            ReadDirection::Backward => {
                let upper = if start < 0 { i64::MAX } else { start };
                state.all.range(..=upper).rev().take(limit).map(|(p, _)| *p).collect()
            }
        };

        Ok(positions
            .into_iter()
            .filter_map(|p| {
                let (key, _) = state.all.get(&p)?;
                state.lookup(p).map(|m| self.to_message(key, m, prefetch))
            })
            .collect())
    }

    async fn delete_stream(
        &self,
        deletion: StreamDeletion,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        let head = state.streams.get(deletion.key.id()).map(MemoryStream::head);
        let exists = check_delete(deletion.key.original(), deletion.expected_version, head)?;

        let deleted_key = StreamKey::new(DELETED_STREAM_ID);
        let tombstone = vec![deletion.tombstone];
        let tombstone_plan = if exists {
            Some(state.plan(&deleted_key, ExpectedVersion::Any, &tombstone)?)
        } else {
            None
        };
        ensure_not_cancelled(cancel)?;

        state.remove_stream(deletion.metadata_key.id());
        state.remove_stream(deletion.key.id());
        if let Some(AppendPlan::Write { create_stream }) = tombstone_plan {
            state.write(&deleted_key, create_stream, tombstone, created_utc);
        }
        Ok(exists)
    }

    async fn delete_messages(
        &self,
        key: &StreamKey,
        deletions: Vec<MessageDeletion>,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>> {
        let mut state = self.state.write().await;

        let mut seen = HashSet::new();
        let present: Vec<MessageDeletion> = deletions
            .into_iter()
            .filter(|d| state.contains(key.id(), d.message_id) && seen.insert(d.message_id))
            .collect();
        if present.is_empty() {
            return Ok(Vec::new());
        }

        let deleted_key = StreamKey::new(DELETED_STREAM_ID);
        let (removed, tombstones): (Vec<Uuid>, Vec<NewStreamMessage>) =
            present.into_iter().map(|d| (d.message_id, d.tombstone)).unzip();
        let plan = state.plan(&deleted_key, ExpectedVersion::Any, &tombstones)?;
        ensure_not_cancelled(cancel)?;

        for id in &removed {
            state.remove_message(key.id(), *id);
        }
        if let AppendPlan::Write { create_stream } = plan {
            state.write(&deleted_key, create_stream, tombstones, created_utc);
        }
        Ok(removed)
    }

    async fn read_head_position(&self, cancel: &CancellationToken) -> Result<i64> {
        ensure_not_cancelled(cancel)?;
        let state = self.state.read().await;
        Ok(state.all.keys().next_back().copied().unwrap_or(-1))
    }

    async fn read_stream_head(&self, key: &StreamKey, cancel: &CancellationToken) -> Result<Option<StreamHead>> {
        ensure_not_cancelled(cancel)?;
        let state = self.state.read().await;
        Ok(state.streams.get(key.id()).map(MemoryStream::head))
    }

    async fn list_streams(
        &self,
        pattern: &Pattern,
        max_count: usize,
        continuation_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ListStreamsPage> {
        ensure_not_cancelled(cancel)?;
        let after = parse_continuation(continuation_token)?;
        let state = self.state.read().await;

        let mut found: Vec<(i64, String)> = state
            .order
            .range(after + 1..)
            .filter_map(|(seq, key)| {
                let stream = state.streams.get(key)?;
                pattern.matches(&stream.original_id).then(|| (*seq, stream.original_id.clone()))
            })
            .take(max_count + 1)
            .collect();

        let continuation_token = if found.len() > max_count {
            found.truncate(max_count);
            found.last().map(|(seq, _)| seq.to_string()).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(ListStreamsPage {
            stream_ids: found.into_iter().map(|(_, id)| id).collect(),
            continuation_token,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
