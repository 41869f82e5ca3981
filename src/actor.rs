//! # SQLite Backend Actor
//!
//! SQLite connections are blocking and not `Sync`. The backend therefore runs
//! its [`SqliteStorage`] on one dedicated thread and talks to it through a
//! channel:
//!
//! ```text
//!   async callers                           "streamstore-sqlite" thread
//!  ┌──────────────┐   Request + oneshot    ┌─────────────────────────┐
//!  │ SqliteBackend├───────────────────────►│ loop { blocking_recv }  │
//!  │   (Clone)    │◄───────────────────────┤   SqliteStorage (R/W)   │
//!  └──────────────┘      Result<T>         └────────────┬────────────┘
//!                                                       ▼
//!                                                 SQLite (WAL)
//! ```
//!
//! ## Single Writer
//!
//! The thread owns the only connection, so requests are executed one at a
//! time in arrival order. That is what makes the expected-version check and
//! the write that follows it atomic with respect to other appends.
//!
//! ## Shutdown
//!
//! `shutdown` queues a `Shutdown` request behind any pending work and joins the
//! thread. Dropping every handle without shutting down closes the channel,
//! which also ends the loop.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{
    ensure_not_cancelled, AppendOutcome, MessageDeletion, StoredMessage, StreamDeletion, StreamSlice,
    StreamStoreBackend,
};
use crate::concurrency::StreamHead;
use crate::error::{Error, Result};
use crate::schema::Database;
use crate::storage::SqliteStorage;
use crate::stream_id::StreamKey;
use crate::types::{
    ExpectedVersion, JsonDataLoader, ListStreamsPage, NewStreamMessage, Pattern, ReadDirection, StreamMessage,
};

/// Maximum number of requests queued for the actor thread.
const REQUEST_CHANNEL_BOUND: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T>>;

// =============================================================================
// Requests
// =============================================================================

enum Request {
    Append {
        key: StreamKey,
        expected_version: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        created_utc: DateTime<Utc>,
        cancel: CancellationToken,
        reply: Reply<AppendOutcome>,
    },
    ReadStream {
        key: StreamKey,
        start: i32,
        limit: usize,
        direction: ReadDirection,
        prefetch: bool,
        reply: Reply<Option<(StreamHead, Vec<StoredMessage>)>>,
    },
    ReadAll {
        start: i64,
        limit: usize,
        direction: ReadDirection,
        prefetch: bool,
        reply: Reply<Vec<StoredMessage>>,
    },
    LoadJsonData {
        position: i64,
        message_id: Uuid,
        reply: Reply<Option<String>>,
    },
    DeleteStream {
        deletion: StreamDeletion,
        created_utc: DateTime<Utc>,
        cancel: CancellationToken,
        reply: Reply<bool>,
    },
    DeleteMessages {
        key: StreamKey,
        deletions: Vec<MessageDeletion>,
        created_utc: DateTime<Utc>,
        cancel: CancellationToken,
        reply: Reply<Vec<Uuid>>,
    },
    ReadHeadPosition {
        reply: Reply<i64>,
    },
    ReadStreamHead {
        key: StreamKey,
        reply: Reply<Option<StreamHead>>,
    },
    ListStreams {
        pattern: Pattern,
        max_count: usize,
        continuation_token: Option<String>,
        reply: Reply<ListStreamsPage>,
    },
    Shutdown,
}

/// The actor's main loop.
fn run_actor(mut storage: SqliteStorage, mut request_rx: mpsc::Receiver<Request>) {
    while let Some(request) = request_rx.blocking_recv() {
        match request {
            Request::Append {
                key,
                expected_version,
                messages,
                created_utc,
                cancel,
                reply,
            } => {
                let _ = reply.send(storage.append(&key, expected_version, messages, created_utc, &cancel));
            }
            Request::ReadStream {
                key,
                start,
                limit,
                direction,
                prefetch,
                reply,
            } => {
                let _ = reply.send(storage.read_stream(&key, start, limit, direction, prefetch));
            }
            Request::ReadAll {
                start,
                limit,
                direction,
                prefetch,
                reply,
            } => {
                let _ = reply.send(storage.read_all(start, limit, direction, prefetch));
            }
            Request::LoadJsonData {
                position,
                message_id,
                reply,
            } => {
                let _ = reply.send(storage.load_json_data(position, message_id));
            }
            Request::DeleteStream {
                deletion,
                created_utc,
                cancel,
                reply,
            } => {
                let _ = reply.send(storage.delete_stream(deletion, created_utc, &cancel));
            }
            Request::DeleteMessages {
                key,
                deletions,
                created_utc,
                cancel,
                reply,
            } => {
                let _ = reply.send(storage.delete_messages(&key, deletions, created_utc, &cancel));
            }
            Request::ReadHeadPosition { reply } => {
                let _ = reply.send(storage.read_head_position());
            }
            Request::ReadStreamHead { key, reply } => {
                let _ = reply.send(storage.read_stream_head(&key));
            }
            Request::ListStreams {
                pattern,
                max_count,
                continuation_token,
                reply,
            } => {
                let _ = reply.send(storage.list_streams(&pattern, max_count, continuation_token.as_deref()));
            }
            Request::Shutdown => break,
        }
    }
    debug!("sqlite actor stopped");
}

// =============================================================================
// Handle
// =============================================================================

struct ActorHandle {
    request_tx: mpsc::Sender<Request>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// SQLite-backed [`StreamStoreBackend`]. Cloning shares the same actor thread.
#[derive(Clone)]
pub struct SqliteBackend {
    inner: Arc<ActorHandle>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Opens (or creates) a database file and starts the actor thread.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::spawn(Database::open(path)?)
    }

    /// Starts a backend over a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::spawn(Database::open_in_memory()?)
    }

    fn spawn(db: Database) -> Result<Self> {
        let storage = SqliteStorage::new(db.into_connection());
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_BOUND);

        let thread = thread::Builder::new()
            .name("streamstore-sqlite".to_string())
            .spawn(move || run_actor(storage, request_rx))
            .map_err(|e| Error::Backend(format!("failed to spawn sqlite actor thread: {}", e)))?;

        Ok(Self {
            inner: Arc::new(ActorHandle {
                request_tx,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (reply, response_rx) = oneshot::channel();

        self.inner
            .request_tx
            .send(make(reply))
            .await
            .map_err(|_| Error::Backend("sqlite actor has shut down".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Backend("sqlite actor dropped response channel".to_string()))?
    }

    fn loader(&self, position: i64, message_id: Uuid) -> JsonDataLoader {
        let backend = self.clone();
        Arc::new(move || {
            let backend = backend.clone();
            async move {
                backend
                    .call(|reply| Request::LoadJsonData {
                        position,
                        message_id,
                        reply,
                    })
                    .await
            }
            .boxed()
        })
    }

    fn to_message(&self, stored: StoredMessage, prefetch: bool) -> StreamMessage {
        let loader = (!prefetch).then(|| self.loader(stored.position, stored.message_id));
        stored.into_message(loader)
    }
}

#[async_trait]
impl StreamStoreBackend for SqliteBackend {
    async fn append(
        &self,
        key: &StreamKey,
        expected_version: ExpectedVersion,
        messages: Vec<NewStreamMessage>,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<AppendOutcome> {
        ensure_not_cancelled(cancel)?;
        self.call(|reply| Request::Append {
            key: key.clone(),
            expected_version,
            messages,
            created_utc,
            cancel: cancel.clone(),
            reply,
        })
        .await
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
        let slice = self
            .call(|reply| Request::ReadStream {
                key: key.clone(),
                start,
                limit,
                direction,
                prefetch,
                reply,
            })
            .await?;

        Ok(slice.map(|(head, messages)| StreamSlice {
            head,
            messages: messages.into_iter().map(|m| self.to_message(m, prefetch)).collect(),
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
        let messages = self
            .call(|reply| Request::ReadAll {
                start,
                limit,
                direction,
                prefetch,
                reply,
            })
            .await?;
        Ok(messages.into_iter().map(|m| self.to_message(m, prefetch)).collect())
    }

    async fn delete_stream(
        &self,
        deletion: StreamDeletion,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        ensure_not_cancelled(cancel)?;
        self.call(|reply| Request::DeleteStream {
            deletion,
            created_utc,
            cancel: cancel.clone(),
            reply,
        })
        .await
    }

    async fn delete_messages(
        &self,
        key: &StreamKey,
        deletions: Vec<MessageDeletion>,
        created_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>> {
        ensure_not_cancelled(cancel)?;
        self.call(|reply| Request::DeleteMessages {
            key: key.clone(),
            deletions,
            created_utc,
            cancel: cancel.clone(),
            reply,
        })
        .await
    }

    async fn read_head_position(&self, cancel: &CancellationToken) -> Result<i64> {
        ensure_not_cancelled(cancel)?;
        self.call(|reply| Request::ReadHeadPosition { reply }).await
    }

    async fn read_stream_head(&self, key: &StreamKey, cancel: &CancellationToken) -> Result<Option<StreamHead>> {
        ensure_not_cancelled(cancel)?;
        self.call(|reply| Request::ReadStreamHead { key: key.clone(), reply }).await
    }

    async fn list_streams(
        &self,
        pattern: &Pattern,
        max_count: usize,
        continuation_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ListStreamsPage> {
        ensure_not_cancelled(cancel)?;
        self.call(|reply| Request::ListStreams {
            pattern: pattern.clone(),
            max_count,
            continuation_token: continuation_token.map(str::to_string),
            reply,
        })
        .await
    }

    async fn shutdown(&self) {
        let _ = self.inner.request_tx.send(Request::Shutdown).await;

        let thread = match self.inner.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                _ => warn!("sqlite actor thread did not stop cleanly"),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
