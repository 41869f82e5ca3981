#![allow(dead_code, unused_macros)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use streamstore::{
    BoxError, Clock, InMemoryBackend, ManualClock, NewStreamMessage, SqliteBackend, StreamMessage,
    StreamStore, StreamStoreSettings, SubscriptionDroppedReason, SubscriptionHandler,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runs each generic scenario against both backends.
///
/// Every `name` must be an `async fn name<B: StreamStoreBackend>(store: StreamStore<B>)`
/// at the root of the test file.
macro_rules! backend_tests {
    ($($name:ident),* $(,)?) => {
        mod in_memory {
            $(
                #[tokio::test]
                async fn $name() {
                    super::common::init_tracing();
                    super::$name(super::common::memory_store()).await;
                }
            )*
        }

        mod sqlite {
            $(
                #[tokio::test]
                async fn $name() {
                    super::common::init_tracing();
                    let (_dir, store) = super::common::sqlite_store();
                    super::$name(store).await;
                }
            )*
        }
    };
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Settings that keep gap reloads short so tests with deleted messages stay fast.
pub fn test_settings() -> StreamStoreSettings {
    StreamStoreSettings {
        gap_reload_interval: Duration::from_millis(10),
        ..StreamStoreSettings::default()
    }
}

pub fn memory_store() -> StreamStore<InMemoryBackend> {
    StreamStore::with_settings(InMemoryBackend::new(), test_settings())
}

pub fn memory_store_with_clock(clock: Arc<dyn Clock>) -> StreamStore<InMemoryBackend> {
    StreamStore::with_clock(InMemoryBackend::new(), test_settings(), clock)
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn sqlite_store() -> (tempfile::TempDir, StreamStore<SqliteBackend>) {
    let (dir, path) = create_temp_db_file("store.db");
    let backend = SqliteBackend::open(&path).expect("open sqlite backend");
    (dir, StreamStore::with_settings(backend, test_settings()))
}

pub fn sqlite_store_with_clock(clock: Arc<dyn Clock>) -> (tempfile::TempDir, StreamStore<SqliteBackend>) {
    let (dir, path) = create_temp_db_file("store.db");
    let backend = SqliteBackend::open(&path).expect("open sqlite backend");
    (dir, StreamStore::with_clock(backend, test_settings(), clock))
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc::now()))
}

pub fn cancel() -> CancellationToken {
    CancellationToken::new()
}

/// A message whose id and body are derived from `n`, so the same `n` means
/// the same message.
pub fn message(n: u128) -> NewStreamMessage {
    NewStreamMessage::new(Uuid::from_u128(n), "test-event", format!("{{\"n\":{}}}", n))
}

pub fn messages(ns: &[u128]) -> Vec<NewStreamMessage> {
    ns.iter().copied().map(message).collect()
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// Recording Subscription Handler
// =============================================================================

#[derive(Debug, Default)]
pub struct Recorded {
    pub messages: Vec<StreamMessage>,
    pub caught_up: Vec<bool>,
    pub dropped: Vec<SubscriptionDroppedReason>,
}

/// Records everything a subscription reports.
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    pub recorded: Arc<Mutex<Recorded>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self) -> usize {
        self.recorded.lock().unwrap().messages.len()
    }

    pub fn versions(&self) -> Vec<i32> {
        self.recorded
            .lock()
            .unwrap()
            .messages
            .iter()
            .map(|m| m.stream_version)
            .collect()
    }

    pub fn positions(&self) -> Vec<i64> {
        self.recorded
            .lock()
            .unwrap()
            .messages
            .iter()
            .map(|m| m.position)
            .collect()
    }

    pub fn caught_up(&self) -> Vec<bool> {
        self.recorded.lock().unwrap().caught_up.clone()
    }

    pub fn dropped(&self) -> Vec<SubscriptionDroppedReason> {
        self.recorded.lock().unwrap().dropped.clone()
    }
}

#[async_trait]
impl SubscriptionHandler for RecordingHandler {
    async fn message_received(
        &mut self,
        message: StreamMessage,
        _cancel: &CancellationToken,
    ) -> Result<(), BoxError> {
        self.recorded.lock().unwrap().messages.push(message);
        Ok(())
    }

    async fn has_caught_up(&mut self, caught_up: bool) {
        self.recorded.lock().unwrap().caught_up.push(caught_up);
    }

    async fn subscription_dropped(&mut self, reason: SubscriptionDroppedReason, _error: Option<BoxError>) {
        self.recorded.lock().unwrap().dropped.push(reason);
    }
}
