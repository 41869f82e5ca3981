//! Serial background work queue.
//!
//! Purging expired messages and background scavenging must not run on the
//! caller's read path. Jobs are queued here and executed one at a time, in
//! order, by a single tokio task. Each job receives the queue's cancellation
//! token; cancelling the queue drops every job that has not started yet.

use std::future::Future;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// A single-worker FIFO job queue.
#[derive(Debug)]
pub struct TaskQueue {
    jobs_tx: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Starts the worker. Must be called inside a tokio runtime.
    pub fn new(cancel: CancellationToken) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(jobs_rx, cancel.clone()));

        Self {
            jobs_tx,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues `job` and returns a future of its result.
    ///
    /// The job is queued immediately; dropping the returned future does not
    /// un-queue it. The future resolves to `Error::Disposed` if the queue is
    /// cancelled before the job completes.
    pub fn enqueue<F, Fut, T>(&self, job: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let boxed: Job = Box::new(move |cancel| {
            async move {
                let _ = result_tx.send(job(cancel).await);
            }
            .boxed()
        });

        let queued = !self.cancel.is_cancelled() && self.jobs_tx.send(boxed).is_ok();

        async move {
            if !queued {
                return Err(Error::Disposed);
            }
            result_rx.await.map_err(|_| Error::Disposed)?
        }
    }

    /// Cancels the running job and discards queued ones.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Cancels and waits for the worker to stop.
    pub async fn shutdown(&self) {
        self.dispose();
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn run_worker(mut jobs_rx: mpsc::UnboundedReceiver<Job>, cancel: CancellationToken) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = job(cancel.clone()) => {}
        }
    }
    debug!("task queue stopped");
}
