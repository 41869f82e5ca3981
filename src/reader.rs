//! # Read Path
//!
//! Paged reads of one stream or of the global log, in either direction.
//!
//! ## Page Boundaries
//!
//! Every read asks the backend for one message more than the caller wants.
//! If the extra message comes back there is another page; it is dropped
//! before the page is returned:
//!
//! ```text
//!   max_count = 3          backend limit = 4
//!
//!   [v5][v6][v7][v8]  ──►  page [v5][v6][v7]   is_end = false, next = 8
//!   [v5][v6]          ──►  page [v5][v6]       is_end = true,  next = 7
//! ```
//!
//! `is_end` only means "nothing more right now". A forward reader may ask for
//! `next` again later and receive messages appended since.
//!
//! ## Gaps in the Global Log
//!
//! Positions are handed out inside write transactions, so a reader can see
//! position 12 committed while 11 is still in flight. A forward page that
//! reaches the end and has a hole in it is read again once after
//! `gap_reload_interval`. Whatever the second read returns is passed through:
//! a hole left by a deleted message never fills in.
//!
//! ## Expiry
//!
//! Messages of user streams whose `MaxAge` has passed are dropped from the
//! page and queued for deletion. Continuations are computed before the
//! filter, so paging never stalls on a page made only of expired messages.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::StreamStore;
use crate::backend::StreamStoreBackend;
use crate::error::{Error, Result};
use crate::stream_id::StreamId;
use crate::types::{
    PageReadStatus, ReadAllPage, ReadDirection, ReadStreamPage, StreamMessage, StreamVersion, RESERVED_PREFIX,
};

impl<B: StreamStoreBackend> StreamStore<B> {
    // =========================================================================
    // Per-Stream Reads
    // =========================================================================

    /// Reads `stream_id` from `from_version` (inclusive) towards its head.
    ///
    /// A stream that does not exist, or was deleted, yields a page with
    /// status `StreamNotFound`.
    pub async fn read_stream_forwards(
        &self,
        stream_id: &str,
        from_version: i32,
        max_count: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<ReadStreamPage> {
        self.check_usable(cancel)?;
        if from_version < StreamVersion::START {
            return Err(Error::InvalidArgument(format!(
                "from_version must be >= 0 for a forward read, got {}",
                from_version
            )));
        }
        self.read_stream_page(stream_id, from_version, max_count, ReadDirection::Forward, prefetch, cancel)
            .await
    }

    /// Reads `stream_id` from `from_version` (inclusive) towards version 0.
    /// Pass `StreamVersion::END` to start at the last message.
    pub async fn read_stream_backwards(
        &self,
        stream_id: &str,
        from_version: i32,
        max_count: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<ReadStreamPage> {
        self.check_usable(cancel)?;
        if from_version < StreamVersion::END {
            return Err(Error::InvalidArgument(format!(
                "from_version must be >= -1 for a backward read, got {}",
                from_version
            )));
        }
        self.read_stream_page(stream_id, from_version, max_count, ReadDirection::Backward, prefetch, cancel)
            .await
    }

    /// Reads the page after `page`, in the same direction.
    pub async fn read_next_stream_page(
        &self,
        page: &ReadStreamPage,
        max_count: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<ReadStreamPage> {
        match page.direction {
            ReadDirection::Forward => {
                let from = page.next_stream_version.max(StreamVersion::START);
                self.read_stream_forwards(&page.stream_id, from, max_count, prefetch, cancel)
                    .await
            }
            ReadDirection::Backward => {
                self.read_stream_backwards(&page.stream_id, page.next_stream_version, max_count, prefetch, cancel)
                    .await
            }
        }
    }

    async fn read_stream_page(
        &self,
        stream_id: &str,
        from_version: i32,
        max_count: usize,
        direction: ReadDirection,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<ReadStreamPage> {
        let stream_id = StreamId::new(stream_id)?;
        check_max_count(max_count)?;

        let slice = self
            .inner
            .backend
            .read_stream(&stream_id.key(), from_version, max_count + 1, direction, prefetch, cancel)
            .await?;
        let Some(slice) = slice else {
            return Ok(ReadStreamPage::not_found(stream_id.as_str(), from_version, direction));
        };

        let mut messages = slice.messages;
        let is_end = messages.len() <= max_count;
        messages.truncate(max_count);

        let next_stream_version = match (direction, messages.last()) {
            (ReadDirection::Forward, Some(last)) => last.stream_version + 1,
            (ReadDirection::Forward, None) => slice.head.last_version + 1,
            (ReadDirection::Backward, Some(last)) => (last.stream_version - 1).max(StreamVersion::START),
            (ReadDirection::Backward, None) => StreamVersion::START,
        };

        let messages = self.filter_expired(messages, cancel).await?;

        Ok(ReadStreamPage {
            stream_id: stream_id.to_string(),
            status: PageReadStatus::Success,
            from_stream_version: from_version,
            next_stream_version,
            last_stream_version: slice.head.last_version,
            last_stream_position: slice.head.last_position,
            direction,
            is_end,
            messages,
        })
    }

    // =========================================================================
    // Global Reads
    // =========================================================================

    /// Reads the global log from `from_position` (inclusive) towards the head.
    pub async fn read_all_forwards(
        &self,
        from_position: i64,
        max_count: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<ReadAllPage> {
        self.check_usable(cancel)?;
        check_max_count(max_count)?;
        if from_position < 0 {
            return Err(Error::InvalidArgument(format!(
                "from_position must be >= 0 for a forward read, got {}",
                from_position
            )));
        }

        let (mut messages, mut is_end) = self
            .read_all_slice(from_position, max_count, ReadDirection::Forward, prefetch, cancel)
            .await?;

        if is_end && messages.len() > 1 && has_gap(from_position, &messages) {
            debug!(
                from_position,
                delay = ?self.inner.settings.gap_reload_interval,
                "gap in read-all page, reloading"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.inner.shutdown.cancelled() => return Err(Error::Disposed),
                _ = tokio::time::sleep(self.inner.settings.gap_reload_interval) => {}
            }
            (messages, is_end) = self
                .read_all_slice(from_position, max_count, ReadDirection::Forward, prefetch, cancel)
                .await?;
        }

        let next_position = messages.last().map_or(from_position, |last| last.position + 1);
        let messages = self.filter_expired(messages, cancel).await?;

        Ok(ReadAllPage {
            from_position,
            next_position,
            is_end,
            direction: ReadDirection::Forward,
            messages,
        })
    }

    /// Reads the global log from `from_position` (inclusive) towards position 0.
    /// Pass `Position::END` to start at the head.
    pub async fn read_all_backwards(
        &self,
        from_position: i64,
        max_count: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<ReadAllPage> {
        self.check_usable(cancel)?;
        check_max_count(max_count)?;
        if from_position < -1 {
            return Err(Error::InvalidArgument(format!(
                "from_position must be >= -1 for a backward read, got {}",
                from_position
            )));
        }

        let (messages, is_end) = self
            .read_all_slice(from_position, max_count, ReadDirection::Backward, prefetch, cancel)
            .await?;

        let next_position = messages.last().map_or(0, |last| (last.position - 1).max(0));
        let messages = self.filter_expired(messages, cancel).await?;

        Ok(ReadAllPage {
            from_position,
            next_position,
            is_end,
            direction: ReadDirection::Backward,
            messages,
        })
    }

    /// Reads the page after `page`, in the same direction.
    pub async fn read_next_all_page(
        &self,
        page: &ReadAllPage,
        max_count: usize,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<ReadAllPage> {
        match page.direction {
            ReadDirection::Forward => {
                self.read_all_forwards(page.next_position, max_count, prefetch, cancel)
                    .await
            }
            ReadDirection::Backward => {
                self.read_all_backwards(page.next_position, max_count, prefetch, cancel)
                    .await
            }
        }
    }

    async fn read_all_slice(
        &self,
        from_position: i64,
        max_count: usize,
        direction: ReadDirection,
        prefetch: bool,
        cancel: &CancellationToken,
    ) -> Result<(Vec<StreamMessage>, bool)> {
        let mut messages = self
            .inner
            .backend
            .read_all(from_position, max_count + 1, direction, prefetch, cancel)
            .await?;
        let is_end = messages.len() <= max_count;
        messages.truncate(max_count);
        Ok((messages, is_end))
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Drops messages past their stream's max age and queues them for deletion.
    async fn filter_expired(
        &self,
        messages: Vec<StreamMessage>,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamMessage>> {
        let now = self.inner.clock.utc_now();
        let mut max_ages: HashMap<String, Option<i32>> = HashMap::new();
        let mut expired: HashMap<String, Vec<Uuid>> = HashMap::new();
        let mut kept = Vec::with_capacity(messages.len());

        for message in messages {
            if message.stream_id.starts_with(RESERVED_PREFIX) {
                kept.push(message);
                continue;
            }

            let max_age = match max_ages.get(&message.stream_id) {
                Some(max_age) => *max_age,
                None => {
                    let max_age = self.cached_max_age(&message.stream_id, cancel).await?;
                    max_ages.insert(message.stream_id.clone(), max_age);
                    max_age
                }
            };

            match max_age {
                Some(seconds) if message.created_utc + chrono::Duration::seconds(seconds.into()) < now => {
                    expired
                        .entry(message.stream_id.clone())
                        .or_default()
                        .push(message.message_id);
                }
                _ => kept.push(message),
            }
        }

        for (stream_id, message_ids) in expired {
            self.purge_expired(stream_id, message_ids);
        }
        Ok(kept)
    }

    fn purge_expired(&self, stream_id: String, message_ids: Vec<Uuid>) {
        debug!(stream = %stream_id, count = message_ids.len(), "purging expired messages");
        let store = self.clone();
        // Queued now; nobody waits for the outcome.
        let _ = self.inner.tasks.enqueue(move |cancel| async move {
            let stream_id = StreamId::new(stream_id)?;
            if let Err(e) = store.remove_messages(&stream_id, &message_ids, &cancel).await {
                warn!(stream = %stream_id, error = %e, "failed to purge expired messages");
            }
            Ok(())
        });
    }
}

fn check_max_count(max_count: usize) -> Result<()> {
    if max_count == 0 {
        return Err(Error::InvalidArgument("max_count must be positive".to_string()));
    }
    Ok(())
}

/// True if the page does not start at `from_position` or skips a position.
fn has_gap(from_position: i64, messages: &[StreamMessage]) -> bool {
    let Some(first) = messages.first() else {
        return false;
    };
    first.position != from_position || messages.windows(2).any(|pair| pair[1].position - pair[0].position != 1)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;

    use crate::api::StreamStoreSettings;
    use crate::clock::ManualClock;
    use crate::memory::InMemoryBackend;
    use crate::types::{ExpectedVersion, NewStreamMessage, Position};

    fn msg(n: u128) -> NewStreamMessage {
        NewStreamMessage::new(Uuid::from_u128(n), "type", format!("{{\"n\":{}}}", n))
    }

    fn fast_settings() -> StreamStoreSettings {
        StreamStoreSettings {
            gap_reload_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn store_with(streams: &[(&str, std::ops::RangeInclusive<u128>)]) -> StreamStore<InMemoryBackend> {
        let store = StreamStore::with_settings(InMemoryBackend::new(), fast_settings());
        let cancel = CancellationToken::new();
        for (id, range) in streams {
            store
                .append_to_stream(id, ExpectedVersion::Any, range.clone().map(msg).collect(), &cancel)
                .await
                .unwrap();
        }
        store
    }

    fn versions(page: &ReadStreamPage) -> Vec<i32> {
        page.messages.iter().map(|m| m.stream_version).collect()
    }

    fn positions(page: &ReadAllPage) -> Vec<i64> {
        page.messages.iter().map(|m| m.position).collect()
    }

    #[tokio::test]
    async fn test_forward_pages_follow_next_version() {
        let store = store_with(&[("s", 1..=5)]).await;
        let cancel = CancellationToken::new();

        let page = store.read_stream_forwards("s", 0, 2, true, &cancel).await.unwrap();
        assert_eq!(versions(&page), vec![0, 1]);
        assert_eq!(page.next_stream_version, 2);
        assert!(!page.is_end);
        assert_eq!(page.last_stream_version, 4);

        let page = store.read_next_stream_page(&page, 2, true, &cancel).await.unwrap();
        assert_eq!(versions(&page), vec![2, 3]);
        assert!(!page.is_end);

        let page = store.read_next_stream_page(&page, 2, true, &cancel).await.unwrap();
        assert_eq!(versions(&page), vec![4]);
        assert!(page.is_end);
        assert_eq!(page.next_stream_version, 5);
    }

    #[tokio::test]
    async fn test_exact_page_size_is_end() {
        let store = store_with(&[("s", 1..=3)]).await;
        let page = store
            .read_stream_forwards("s", 0, 3, true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 3);
        assert!(page.is_end);
    }

    #[tokio::test]
    async fn test_backward_from_end() {
        let store = store_with(&[("s", 1..=5)]).await;
        let cancel = CancellationToken::new();

        let page = store
            .read_stream_backwards("s", StreamVersion::END, 3, true, &cancel)
            .await
            .unwrap();
        assert_eq!(versions(&page), vec![4, 3, 2]);
        assert_eq!(page.next_stream_version, 1);
        assert!(!page.is_end);

        let page = store.read_next_stream_page(&page, 3, true, &cancel).await.unwrap();
        assert_eq!(versions(&page), vec![1, 0]);
        assert!(page.is_end);
        assert_eq!(page.next_stream_version, 0);
    }

    #[tokio::test]
    async fn test_missing_stream_is_not_found() {
        let store = store_with(&[]).await;
        let page = store
            .read_stream_forwards("nope", 0, 10, true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(page.status, PageReadStatus::StreamNotFound);
        assert!(page.is_end);
        assert!(page.messages.is_empty());
        assert_eq!(page.last_stream_version, -1);
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let store = store_with(&[("s", 1..=1)]).await;
        let cancel = CancellationToken::new();

        assert!(matches!(
            store.read_stream_forwards("s", -1, 10, true, &cancel).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read_stream_backwards("s", -2, 10, true, &cancel).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read_stream_forwards("s", 0, 0, true, &cancel).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read_stream_forwards("", 0, 10, true, &cancel).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            store.read_all_forwards(-1, 10, true, &cancel).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_read_all_interleaves_streams() {
        let store = store_with(&[("a", 1..=2), ("b", 3..=4), ("a", 5..=5)]).await;
        let cancel = CancellationToken::new();

        let page = store.read_all_forwards(Position::START, 10, true, &cancel).await.unwrap();
        assert_eq!(positions(&page), vec![0, 1, 2, 3, 4]);
        let ids: Vec<&str> = page.messages.iter().map(|m| m.stream_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a", "b", "b", "a"]);
        assert!(page.is_end);
        assert_eq!(page.next_position, 5);
    }

    #[tokio::test]
    async fn test_read_all_backward_paging() {
        let store = store_with(&[("s", 1..=5)]).await;
        let cancel = CancellationToken::new();

        let page = store.read_all_backwards(Position::END, 2, true, &cancel).await.unwrap();
        assert_eq!(positions(&page), vec![4, 3]);
        assert!(!page.is_end);

        let page = store.read_next_all_page(&page, 2, true, &cancel).await.unwrap();
        assert_eq!(positions(&page), vec![2, 1]);

        let page = store.read_next_all_page(&page, 2, true, &cancel).await.unwrap();
        assert_eq!(positions(&page), vec![0]);
        assert!(page.is_end);
    }

    #[tokio::test]
    async fn test_read_all_on_empty_store() {
        let store = store_with(&[]).await;
        let cancel = CancellationToken::new();

        let page = store.read_all_forwards(0, 10, true, &cancel).await.unwrap();
        assert!(page.messages.is_empty());
        assert!(page.is_end);
        assert_eq!(page.next_position, 0);

        let page = store.read_all_backwards(Position::END, 10, true, &cancel).await.unwrap();
        assert!(page.is_end);
        assert_eq!(page.next_position, 0);
    }

    #[tokio::test]
    async fn test_persistent_gap_is_passed_through() {
        let store = store_with(&[("s", 1..=4)]).await;
        let cancel = CancellationToken::new();
        store.delete_message("s", Uuid::from_u128(2), &cancel).await.unwrap();

        // Position 1 is gone for good; the reload happens once and the hole stays.
        let page = store.read_all_forwards(0, 10, true, &cancel).await.unwrap();
        assert_eq!(positions(&page), vec![0, 2, 3, 4]);
        assert!(page.is_end);
    }

    #[tokio::test]
    async fn test_deferred_bodies_load_on_demand() {
        let store = store_with(&[("s", 7..=7)]).await;
        let page = store
            .read_stream_forwards("s", 0, 1, false, &CancellationToken::new())
            .await
            .unwrap();

        let message = &page.messages[0];
        assert!(message.prefetched_json_data().is_none());
        assert_eq!(message.json_data().await.unwrap().as_deref(), Some("{\"n\":7}"));
    }

    #[tokio::test]
    async fn test_expired_messages_are_hidden_and_purged() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = StreamStore::with_clock(InMemoryBackend::new(), fast_settings(), clock.clone());
        let cancel = CancellationToken::new();

        store
            .set_stream_metadata("s", ExpectedVersion::NoStream, Some(60), None, None, &cancel)
            .await
            .unwrap();
        store
            .append_to_stream("s", ExpectedVersion::Any, vec![msg(1), msg(2)], &cancel)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(30));
        store
            .append_to_stream("s", ExpectedVersion::Any, vec![msg(3)], &cancel)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(40));

        let page = store.read_stream_forwards("s", 0, 10, true, &cancel).await.unwrap();
        assert_eq!(versions(&page), vec![2]);
        assert_eq!(page.next_stream_version, 3);

        // The purge runs on the task queue, which is FIFO.
        store.inner.tasks.enqueue(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(store.get_stream_message_count("s", &cancel).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reserved_streams_never_expire() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = StreamStore::with_clock(InMemoryBackend::new(), fast_settings(), clock.clone());
        let cancel = CancellationToken::new();

        store
            .set_stream_metadata("s", ExpectedVersion::NoStream, Some(1), None, None, &cancel)
            .await
            .unwrap();
        clock.advance(chrono::Duration::days(1));

        let page = store.read_all_forwards(0, 10, true, &cancel).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].stream_id, "$$s");
    }

    #[tokio::test]
    async fn test_reads_after_dispose_fail() {
        let store = store_with(&[("s", 1..=1)]).await;
        store.dispose().await;

        let result = store
            .read_stream_forwards("s", 0, 1, true, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::Disposed)));
        let result = store.read_all_forwards(0, 1, true, &CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Disposed)));
    }

    #[test]
    fn test_has_gap() {
        let at = |p: i64| StreamMessage::prefetched("s", Uuid::new_v4(), 0, p, Utc::now(), "t", "", "");
        assert!(!has_gap(3, &[at(3), at(4), at(5)]));
        assert!(has_gap(3, &[at(4), at(5)]));
        assert!(has_gap(3, &[at(3), at(5)]));
        assert!(!has_gap(3, &[]));
    }
}
