//! # Write Path
//!
//! Appends, deletions and max-count scavenging.
//!
//! ## Append
//!
//! ```text
//! append_to_stream(id, expected, batch)
//!   │
//!   ├─ validate id (no reserved "$" prefix)
//!   ├─ backend.append ──► transient error? retry up to `append_retries`
//!   ├─ wrote something? ──► notifier.notify_appended()
//!   └─ user stream? ──► scavenge: enforce MaxCount from $$id metadata
//! ```
//!
//! ## Deletion Tombstones
//!
//! Deletions are recorded as ordinary messages in `$deleted` so that global
//! subscribers can observe them:
//!
//! | Operation | Tombstone type | Body |
//! |-----------|----------------|------|
//! | `delete_stream` | `$stream-deleted` | `{"StreamId": ..}` |
//! | `delete_message` | `$message-deleted` | `{"StreamId": .., "MessageId": ..}` |
//!
//! The backend removes the data and appends the tombstone in one atomic step,
//! so a deletion is never durable without its tombstone. Scavenging and expiry
//! purges go through the same message deletion, so they leave tombstones too.
//!
//! ## Scavenging
//!
//! After a write to stream `s`, if `$$s` sets `MaxCount = n` and `s` holds
//! more than `n` messages, the oldest ones are deleted until `n` remain. A
//! scavenge failure is logged and never fails the write that triggered it.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::{ScavengeMode, StreamStore};
use crate::backend::{AppendOutcome, MessageDeletion, StreamDeletion, StreamStoreBackend};
use crate::codec::{encode_message_deleted, encode_stream_deleted};
use crate::error::Result;
use crate::stream_id::{StreamId, StreamKey};
use crate::types::{AppendResult, ExpectedVersion, NewStreamMessage, ReadDirection, StreamVersion};

impl<B: StreamStoreBackend> StreamStore<B> {
    // =========================================================================
    // Append
    // =========================================================================

    /// Appends `messages` to `stream_id`.
    ///
    /// The stream is created if needed. Re-sending a batch that is already
    /// stored is a no-op returning the stream's current head.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` for an invalid or reserved stream id, or a
    ///   batch that repeats a message id
    /// - `Error::WrongExpectedVersion` on a concurrency conflict
    /// - `Error::Cancelled` / `Error::Disposed`
    pub async fn append_to_stream(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        cancel: &CancellationToken,
    ) -> Result<AppendResult> {
        self.check_usable(cancel)?;
        let stream_id = StreamId::for_write(stream_id)?;

        let outcome = self
            .append_with_retry(&stream_id.key(), expected_version, messages, cancel)
            .await?;

        if outcome.appended && !stream_id.is_reserved() {
            self.scavenge_after_write(&stream_id, cancel).await;
        }
        Ok(outcome.result)
    }

    /// Runs one backend append, retrying transient failures, and signals
    /// subscribers if anything was written.
    pub(crate) async fn append_with_retry(
        &self,
        key: &StreamKey,
        expected_version: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome> {
        let mut attempt = 0;
        loop {
            let created_utc = self.inner.clock.utc_now();
            let result = self
                .inner
                .backend
                .append(key, expected_version, messages.clone(), created_utc, cancel)
                .await;

            match result {
                Ok(outcome) => {
                    if outcome.appended {
                        self.signal_appended();
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < self.inner.settings.append_retries => {
                    attempt += 1;
                    warn!(stream = %key, attempt, error = %e, "transient append failure, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Deletes a stream, its messages and its metadata.
    ///
    /// Deleting a missing stream is a no-op unless an exact version was
    /// expected. When a stream is actually removed, a `$stream-deleted`
    /// tombstone is appended to `$deleted` in the same backend transaction.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` for `EmptyStream` or a `$`-prefixed stream id
    /// - `Error::WrongExpectedVersion` if the stream is not at the expected version
    pub async fn delete_stream(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.check_usable(cancel)?;
        let stream_id = StreamId::for_user_stream(stream_id)?;

        let deletion = StreamDeletion {
            key: stream_id.key(),
            metadata_key: stream_id.metadata_key(),
            expected_version,
            tombstone: encode_stream_deleted(stream_id.as_str())?,
        };
        let deleted = self
            .inner
            .backend
            .delete_stream(deletion, self.inner.clock.utc_now(), cancel)
            .await?;
        self.inner.cache.invalidate(stream_id.as_str());

        if deleted {
            self.signal_appended();
            debug!(stream = %stream_id, "stream deleted");
        }
        Ok(())
    }

    /// Deletes one message. Deleting a message that does not exist is a no-op.
    ///
    /// # Errors
    ///
    /// `Error::InvalidArgument` for a `$`-prefixed stream id.
    pub async fn delete_message(&self, stream_id: &str, message_id: Uuid, cancel: &CancellationToken) -> Result<()> {
        self.check_usable(cancel)?;
        let stream_id = StreamId::for_user_stream(stream_id)?;
        self.remove_messages(&stream_id, &[message_id], cancel).await?;
        Ok(())
    }

    /// Deletes messages together with a `$message-deleted` tombstone for each
    /// one that existed. Returns how many were removed.
    pub(crate) async fn remove_messages(
        &self,
        stream_id: &StreamId,
        message_ids: &[Uuid],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let deletions = message_ids
            .iter()
            .map(|id| {
                Ok(MessageDeletion {
                    message_id: *id,
                    tombstone: encode_message_deleted(stream_id.as_str(), *id)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let removed = self
            .inner
            .backend
            .delete_messages(&stream_id.key(), deletions, self.inner.clock.utc_now(), cancel)
            .await?;
        if removed.is_empty() {
            return Ok(0);
        }

        self.signal_appended();
        debug!(stream = %stream_id, count = removed.len(), "messages deleted");
        Ok(removed.len())
    }

    // =========================================================================
    // Scavenging
    // =========================================================================

    /// Enforces max count after a write, inline or on the task queue.
    pub(crate) async fn scavenge_after_write(&self, stream_id: &StreamId, cancel: &CancellationToken) {
        match self.inner.settings.scavenge_mode {
            ScavengeMode::Inline => {
                if let Err(e) = self.scavenge(stream_id, cancel).await {
                    warn!(stream = %stream_id, error = %e, "scavenge failed");
                }
            }
            ScavengeMode::Background => {
                let store = self.clone();
                let stream_id = stream_id.clone();
                // The job is queued on the call; its result is not awaited.
                let _ = self.inner.tasks.enqueue(move |cancel| async move {
                    if let Err(e) = store.scavenge(&stream_id, &cancel).await {
                        warn!(stream = %stream_id, error = %e, "background scavenge failed");
                    }
                    Ok(())
                });
            }
        }
    }

    /// Deletes the oldest messages of `stream_id` beyond its max count.
    pub(crate) async fn scavenge(&self, stream_id: &StreamId, cancel: &CancellationToken) -> Result<usize> {
        if stream_id.is_reserved() {
            return Ok(0);
        }
        let Some(max_count) = self.read_metadata(stream_id, cancel).await?.max_count else {
            return Ok(0);
        };

        let key = stream_id.key();
        let Some(head) = self.inner.backend.read_stream_head(&key, cancel).await? else {
            return Ok(0);
        };
        let keep = max_count.max(0) as usize;
        if head.live_count <= keep {
            return Ok(0);
        }

        let excess = head.live_count - keep;
        let oldest = self
            .inner
            .backend
            .read_stream(&key, StreamVersion::START, excess, ReadDirection::Forward, false, cancel)
            .await?;
        let ids: Vec<Uuid> = oldest
            .map(|slice| slice.messages.iter().map(|m| m.message_id).collect())
            .unwrap_or_default();

        let removed = self.remove_messages(stream_id, &ids, cancel).await?;
        debug!(stream = %stream_id, removed, max_count, "scavenged");
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::api::StreamStoreSettings;
    use crate::backend::StreamSlice;
    use crate::concurrency::StreamHead;
    use crate::error::Error;
    use crate::memory::InMemoryBackend;
    use crate::types::{ListStreamsPage, Pattern, StreamMessage, DELETED_STREAM_ID};

    /// In-memory backend with injectable faults.
    #[derive(Default)]
    struct FaultyBackend {
        inner: InMemoryBackend,
        /// Appends still to be failed with SQLITE_BUSY.
        busy_appends: AtomicU32,
        append_calls: AtomicU32,
        fail_metadata_reads: AtomicBool,
        /// Cancels the caller's token once the deletion has reached the backend.
        cancel_during_delete: AtomicBool,
    }

    fn busy() -> Error {
        Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[async_trait]
    impl StreamStoreBackend for FaultyBackend {
        async fn append(
            &self,
            key: &StreamKey,
            expected_version: ExpectedVersion,
            messages: Vec<NewStreamMessage>,
            created_utc: DateTime<Utc>,
            cancel: &CancellationToken,
        ) -> Result<AppendOutcome> {
            self.append_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .busy_appends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(busy());
            }
            self.inner.append(key, expected_version, messages, created_utc, cancel).await
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
            if key.original().starts_with("$$") && self.fail_metadata_reads.load(Ordering::SeqCst) {
                return Err(Error::Backend("metadata unavailable".to_string()));
            }
            self.inner.read_stream(key, start, limit, direction, prefetch, cancel).await
        }

        async fn read_all(
            &self,
            start: i64,
            limit: usize,
            direction: ReadDirection,
            prefetch: bool,
            cancel: &CancellationToken,
        ) -> Result<Vec<StreamMessage>> {
            self.inner.read_all(start, limit, direction, prefetch, cancel).await
        }

        async fn delete_stream(
            &self,
            deletion: StreamDeletion,
            created_utc: DateTime<Utc>,
            cancel: &CancellationToken,
        ) -> Result<bool> {
            if self.cancel_during_delete.load(Ordering::SeqCst) {
                cancel.cancel();
            }
            self.inner.delete_stream(deletion, created_utc, cancel).await
        }

        async fn delete_messages(
            &self,
            key: &StreamKey,
            deletions: Vec<MessageDeletion>,
            created_utc: DateTime<Utc>,
            cancel: &CancellationToken,
        ) -> Result<Vec<Uuid>> {
            if self.cancel_during_delete.load(Ordering::SeqCst) {
                cancel.cancel();
            }
            self.inner.delete_messages(key, deletions, created_utc, cancel).await
        }

        async fn read_head_position(&self, cancel: &CancellationToken) -> Result<i64> {
            self.inner.read_head_position(cancel).await
        }

        async fn read_stream_head(&self, key: &StreamKey, cancel: &CancellationToken) -> Result<Option<StreamHead>> {
            self.inner.read_stream_head(key, cancel).await
        }

        async fn list_streams(
            &self,
            pattern: &Pattern,
            max_count: usize,
            continuation_token: Option<&str>,
            cancel: &CancellationToken,
        ) -> Result<ListStreamsPage> {
            self.inner.list_streams(pattern, max_count, continuation_token, cancel).await
        }
    }

    fn msg(n: u128) -> NewStreamMessage {
        NewStreamMessage::new(Uuid::from_u128(n), "type", "{}")
    }

    #[tokio::test]
    async fn test_reserved_ids_are_rejected_for_writes() {
        let store = StreamStore::new(InMemoryBackend::new());
        let cancel = CancellationToken::new();

        let result = store
            .append_to_stream("$system", ExpectedVersion::Any, vec![msg(1)], &cancel)
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let result = store.delete_stream("$$x", ExpectedVersion::Any, &cancel).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_scavenge_keeps_newest() {
        let store = StreamStore::new(InMemoryBackend::new());
        let cancel = CancellationToken::new();

        store
            .set_stream_metadata("s", ExpectedVersion::Any, None, Some(2), None, &cancel)
            .await
            .unwrap();
        store
            .append_to_stream("s", ExpectedVersion::Any, (1..=5).map(msg).collect(), &cancel)
            .await
            .unwrap();

        assert_eq!(store.get_stream_message_count("s", &cancel).await.unwrap(), 2);
        // Versions are not reused after scavenging.
        assert_eq!(store.read_stream_head_version("s", &cancel).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_background_scavenge_eventually_applies() {
        let settings = StreamStoreSettings {
            scavenge_mode: ScavengeMode::Background,
            ..Default::default()
        };
        let store = StreamStore::with_settings(InMemoryBackend::new(), settings);
        let cancel = CancellationToken::new();

        store
            .set_stream_metadata("s", ExpectedVersion::Any, None, Some(1), None, &cancel)
            .await
            .unwrap();
        store
            .append_to_stream("s", ExpectedVersion::Any, (1..=3).map(msg).collect(), &cancel)
            .await
            .unwrap();

        // A queued no-op completes only after the scavenge queued before it.
        store.inner.tasks.enqueue(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(store.get_stream_message_count("s", &cancel).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_message_writes_no_tombstone() {
        let store = StreamStore::new(InMemoryBackend::new());
        let cancel = CancellationToken::new();
        store
            .append_to_stream("s", ExpectedVersion::NoStream, vec![msg(1)], &cancel)
            .await
            .unwrap();

        store.delete_message("s", Uuid::from_u128(42), &cancel).await.unwrap();
        assert_eq!(store.read_stream_head_version(DELETED_STREAM_ID, &cancel).await.unwrap(), -1);

        store.delete_message("s", Uuid::from_u128(1), &cancel).await.unwrap();
        assert_eq!(store.read_stream_head_version(DELETED_STREAM_ID, &cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_append_failures_are_retried() {
        let store = StreamStore::new(FaultyBackend::default());
        let cancel = CancellationToken::new();
        store.backend().busy_appends.store(2, Ordering::SeqCst);

        let result = store
            .append_to_stream("s", ExpectedVersion::NoStream, vec![msg(1)], &cancel)
            .await
            .unwrap();
        assert_eq!(result, AppendResult::new(0, 0));
        assert_eq!(store.backend().append_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = StreamStore::new(FaultyBackend::default());
        let cancel = CancellationToken::new();
        store.backend().busy_appends.store(10, Ordering::SeqCst);

        let result = store
            .append_to_stream("s", ExpectedVersion::NoStream, vec![msg(1)], &cancel)
            .await;
        assert!(matches!(&result, Err(e) if e.is_transient()));
        // one attempt plus the default two retries
        assert_eq!(store.backend().append_calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.read_stream_head_version("s", &cancel).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_scavenge_failure_does_not_fail_append() {
        let store = StreamStore::new(FaultyBackend::default());
        let cancel = CancellationToken::new();
        store
            .set_stream_metadata("s", ExpectedVersion::NoStream, None, Some(1), None, &cancel)
            .await
            .unwrap();
        store.backend().fail_metadata_reads.store(true, Ordering::SeqCst);

        let result = store
            .append_to_stream("s", ExpectedVersion::Any, (1..=3).map(msg).collect(), &cancel)
            .await
            .unwrap();
        assert_eq!(result.current_version, 2);
        // max count could not be read, so nothing was scavenged
        assert_eq!(store.get_stream_message_count("s", &cancel).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_deletion_cancelled_midway_leaves_no_partial_state() {
        let store = StreamStore::new(FaultyBackend::default());
        let cancel = CancellationToken::new();
        store
            .append_to_stream("s", ExpectedVersion::NoStream, (1..=2).map(msg).collect(), &cancel)
            .await
            .unwrap();
        store
            .set_stream_metadata("s", ExpectedVersion::NoStream, None, Some(5), None, &cancel)
            .await
            .unwrap();
        store.backend().cancel_during_delete.store(true, Ordering::SeqCst);

        let token = CancellationToken::new();
        let result = store.delete_stream("s", ExpectedVersion::Any, &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        let token = CancellationToken::new();
        let result = store.delete_message("s", Uuid::from_u128(1), &token).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        assert_eq!(store.get_stream_message_count("s", &cancel).await.unwrap(), 2);
        assert_eq!(store.get_stream_metadata("s", &cancel).await.unwrap().max_count, Some(5));
        assert_eq!(store.read_stream_head_version(DELETED_STREAM_ID, &cancel).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_system_streams_cannot_be_deleted_or_given_metadata() {
        let store = StreamStore::new(InMemoryBackend::new());
        let cancel = CancellationToken::new();

        let result = store.delete_stream(DELETED_STREAM_ID, ExpectedVersion::Any, &cancel).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result = store.delete_message(DELETED_STREAM_ID, Uuid::from_u128(1), &cancel).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result = store
            .set_stream_metadata(DELETED_STREAM_ID, ExpectedVersion::Any, Some(1), None, None, &cancel)
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
