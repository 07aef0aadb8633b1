//! Background execution of decoded requests.
//!
//! A [`WorkerPool`] is a fixed set of tasks draining one FIFO queue.
//! Submission never blocks: a full queue is reported to the caller
//! instead of applying backpressure to the transport's read path. On
//! shutdown the queue is drained by default; [`ShutdownPolicy::Drop`]
//! abandons queued work instead.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::rpc::BoxFuture;

/// What happens to queued-but-unstarted work at shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Finish everything already queued.
    #[default]
    Drain,
    /// Abandon queued work.
    Drop,
}

/// Submission failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker queue is full")]
    QueueFull,
    #[error("worker pool is stopped")]
    Stopped,
}

struct Job {
    fut: BoxFuture,
    done: oneshot::Sender<()>,
}

/// Completion handle returned by [`WorkerPool::submit`].
#[derive(Debug)]
pub struct TaskHandle {
    done: oneshot::Receiver<()>,
}

impl TaskHandle {
    /// Wait for the task to finish.
    ///
    /// Returns `false` when the task was dropped unrun (shutdown with
    /// [`ShutdownPolicy::Drop`]).
    pub async fn wait(self) -> bool {
        self.done.await.is_ok()
    }
}

/// Fixed-size pool of worker tasks over a bounded FIFO queue.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl WorkerPool {
    /// Start `workers` tasks sharing a queue of `queue_depth` slots.
    #[must_use]
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        Self::with_policy(workers, queue_depth, ShutdownPolicy::default())
    }

    /// Start a pool with an explicit shutdown policy.
    #[must_use]
    pub fn with_policy(workers: usize, queue_depth: usize, policy: ShutdownPolicy) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        for worker_id in 0..workers {
            let rx = Arc::clone(&rx);
            let shutdown = shutdown.clone();
            tracker.spawn(async move {
                worker_loop(worker_id, rx, shutdown, policy).await;
            });
        }

        Self {
            tx,
            shutdown,
            tracker,
        }
    }

    /// Queue a task without blocking.
    ///
    /// # Errors
    ///
    /// [`SubmitError::QueueFull`] when every slot is taken,
    /// [`SubmitError::Stopped`] after shutdown began.
    pub fn submit<F>(&self, fut: F) -> Result<TaskHandle, SubmitError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::Stopped);
        }
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            fut: Box::pin(fut),
            done: done_tx,
        };
        match self.tx.try_send(job) {
            Ok(()) => Ok(TaskHandle { done: done_rx }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Stopped),
        }
    }

    /// Stop the pool and wait for workers to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    shutdown: CancellationToken,
    policy: ShutdownPolicy,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                () = shutdown.cancelled() => match policy {
                    ShutdownPolicy::Drop => None,
                    ShutdownPolicy::Drain => rx.try_recv().ok(),
                },
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };
        if AssertUnwindSafe(job.fut).catch_unwind().await.is_err() {
            tracing::error!(worker_id, "worker task panicked");
        }
        let _ = job.done.send(());
    }
}
