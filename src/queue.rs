//! Serialized task queue
//!
//! Every structural change to the registry runs as a task on this queue. A
//! single worker awaits tasks one at a time in submission order, so two
//! concurrent `start` calls for the same topic always observe each other.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::error;

use crate::error::{Result, SupervisorError};

type Job = BoxFuture<'static, ()>;

struct QueueState {
    pending: AtomicUsize,
    idle: Notify,
}

impl QueueState {
    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A work queue with concurrency 1
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Job>,
    state: Arc<QueueState>,
}

impl TaskQueue {
    /// Create the queue and spawn its worker on the current runtime
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let state = Arc::new(QueueState {
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let worker_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("Queued task panicked");
                }
                worker_state.finish_one();
            }
        });

        Self { tx, state }
    }

    /// Number of tasks submitted and not yet finished
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Run `task` on the queue and wait for its output
    pub async fn run<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.submit(async move {
            let _ = result_tx.send(task.await);
        })?;

        result_rx
            .await
            .map_err(|_| SupervisorError::Internal("queued task did not complete".to_string()))
    }

    /// Submit `task` without waiting for it
    pub fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit(task)
    }

    fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(task.boxed()).is_err() {
            self.state.finish_one();
            return Err(SupervisorError::Internal("task queue worker is gone".to_string()));
        }
        Ok(())
    }

    /// Wait until every submitted task has finished
    pub async fn on_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
