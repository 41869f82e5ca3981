//! # Stream Metadata and the Max-Age Cache
//!
//! Every stream `s` may have a shadow stream `$$s` holding `$stream-metadata`
//! records. Only the newest record counts. It carries the retention policy
//! (`MaxAge` in seconds, `MaxCount`) plus free-form JSON.
//!
//! ## Max-Age Cache
//!
//! Expiry filtering asks for the max age of every stream it sees on a read.
//! [`MetadataMaxAgeCache`] keeps those answers for a while:
//!
//! ```text
//!   get_max_age("order-1")
//!        │
//!        ├── entry fresh (cached_at + expiry > now) ──► hit
//!        │
//!        └── missing or stale ──► miss ──► read $$order-1 ──► insert
//!                                                              │
//!                                             FIFO queue full? ▼
//!                                             evict the oldest insertion
//! ```
//!
//! Eviction is first-in-first-out by insertion, not by use. A setter on the
//! same store invalidates its own entry right away; writes from other
//! processes become visible after `expiry`.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::StreamStore;
use crate::backend::StreamStoreBackend;
use crate::clock::Clock;
use crate::codec::{decode_metadata, encode_metadata, MetadataMessage};
use crate::error::{Error, Result};
use crate::stream_id::StreamId;
use crate::types::{ExpectedVersion, ReadDirection, StreamMetadataResult, StreamVersion};

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct CachedMaxAge {
    max_age: Option<i32>,
    cached_at: DateTime<Utc>,
    stamp: u64,
}

/// Bounded, time-limited cache of per-stream max age.
pub struct MetadataMaxAgeCache {
    expiry: chrono::Duration,
    max_size: usize,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, CachedMaxAge>,
    insertion_order: Mutex<VecDeque<(String, u64)>>,
    next_stamp: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MetadataMaxAgeCache {
    pub fn new(expiry: Duration, max_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            expiry: chrono::Duration::from_std(expiry).unwrap_or_else(|_| chrono::Duration::days(36_500)),
            max_size,
            clock,
            entries: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::new()),
            next_stamp: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached max age of `stream_id`, calling `fetch` on a miss.
    pub async fn get_max_age<F, Fut>(&self, stream_id: &str, fetch: F) -> Result<Option<i32>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<i32>>>,
    {
        let now = self.clock.utc_now();
        if let Some(entry) = self.lookup(stream_id) {
            if now.signed_duration_since(entry.cached_at) < self.expiry {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.max_age);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let max_age = fetch().await?;
        self.insert(stream_id, max_age, now);
        Ok(max_age)
    }

    /// Drops the entry for `stream_id` so the next lookup re-reads metadata.
    pub fn invalidate(&self, stream_id: &str) {
        self.entries.remove(stream_id);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of streams currently cached.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    fn lookup(&self, stream_id: &str) -> Option<CachedMaxAge> {
        self.entries.get(stream_id).map(|entry| *entry)
    }

    fn insert(&self, stream_id: &str, max_age: Option<i32>, cached_at: DateTime<Utc>) {
        let stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            stream_id.to_string(),
            CachedMaxAge {
                max_age,
                cached_at,
                stamp,
            },
        );

        let evicted: Vec<(String, u64)> = {
            let mut order = match self.insertion_order.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            order.push_back((stream_id.to_string(), stamp));
            let excess = order.len().saturating_sub(self.max_size);
            order.drain(..excess).collect()
        };

        // A re-inserted stream carries a newer stamp and survives its old slot.
        for (id, stamp) in evicted {
            self.entries.remove_if(&id, |_, entry| entry.stamp == stamp);
        }
    }
}

impl std::fmt::Debug for MetadataMaxAgeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataMaxAgeCache")
            .field("expiry", &self.expiry)
            .field("max_size", &self.max_size)
            .field("count", &self.count())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

// =============================================================================
// Store Operations
// =============================================================================

impl<B: StreamStoreBackend> StreamStore<B> {
    /// Returns the newest metadata of `stream_id`.
    ///
    /// A stream without metadata yields `metadata_stream_version == -1` and no
    /// policy.
    pub async fn get_stream_metadata(
        &self,
        stream_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamMetadataResult> {
        self.check_usable(cancel)?;
        let stream_id = StreamId::new(stream_id)?;
        self.read_metadata(&stream_id, cancel).await
    }

    /// Appends a new metadata record for `stream_id` and returns the version of
    /// the metadata stream.
    ///
    /// `expected_version` refers to the `$$` metadata stream. Re-sending an
    /// identical call is idempotent because the record id is derived from its
    /// content. A new `max_count` is enforced right away.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` for a reserved stream id or `EmptyStream`
    /// - `Error::WrongExpectedVersion` if the metadata stream is not at the
    ///   expected version
    pub async fn set_stream_metadata(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        max_age: Option<i32>,
        max_count: Option<i32>,
        metadata_json: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        self.check_usable(cancel)?;
        let stream_id = StreamId::for_user_stream(stream_id)?;
        if expected_version == ExpectedVersion::EmptyStream {
            return Err(Error::InvalidArgument(
                "EmptyStream is not a valid expected version for metadata".to_string(),
            ));
        }

        let metadata_key = stream_id.metadata_key();
        let record = encode_metadata(
            metadata_key.original(),
            expected_version,
            &MetadataMessage {
                stream_id: stream_id.to_string(),
                max_age,
                max_count,
                meta_json: metadata_json,
            },
        )?;

        let outcome = self
            .append_with_retry(&metadata_key, expected_version, vec![record], cancel)
            .await?;
        self.inner.cache.invalidate(stream_id.as_str());
        debug!(stream = %stream_id, version = outcome.result.current_version, "stream metadata set");

        self.scavenge_after_write(&stream_id, cancel).await;

        Ok(outcome.result.current_version)
    }

    /// Reads the newest record of the metadata stream.
    pub(crate) async fn read_metadata(
        &self,
        stream_id: &StreamId,
        cancel: &CancellationToken,
    ) -> Result<StreamMetadataResult> {
        let slice = self
            .inner
            .backend
            .read_stream(
                &stream_id.metadata_key(),
                StreamVersion::END,
                1,
                ReadDirection::Backward,
                true,
                cancel,
            )
            .await?;

        let Some(record) = slice.and_then(|s| s.messages.into_iter().next()) else {
            return Ok(StreamMetadataResult::none(stream_id.as_str()));
        };

        let json = record.json_data().await?.unwrap_or_default();
        let metadata = decode_metadata(&json)?;

        Ok(StreamMetadataResult {
            stream_id: stream_id.to_string(),
            metadata_stream_version: record.stream_version,
            max_age: metadata.max_age,
            max_count: metadata.max_count,
            metadata_json: metadata.meta_json,
        })
    }

    /// Max age of `stream_id`, through the cache.
    pub(crate) async fn cached_max_age(&self, stream_id: &str, cancel: &CancellationToken) -> Result<Option<i32>> {
        let id = StreamId::new(stream_id)?;
        self.inner
            .cache
            .get_max_age(stream_id, || async {
                self.read_metadata(&id, cancel).await.map(|metadata| metadata.max_age)
            })
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================
