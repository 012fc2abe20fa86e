//! Process-wide serial queue
//!
//! One worker task drains a channel of boxed futures and runs each to
//! completion before starting the next, so the cache-mutating halves of two
//! passes never interleave.

use crate::error::{ImgkeepError, ImgkeepResult};
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Job = BoxFuture<'static, ()>;

/// Single-consumer queue of pass continuations
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl SerialQueue {
    /// Start the worker on the current runtime
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("Queued task panicked; continuing with the next one");
                }
            }
            debug!("serial queue drained");
        });
        Self { tx, worker }
    }

    /// Run `task` after every previously enqueued task has finished
    pub async fn run<F, T>(&self, task: F) -> ImgkeepResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job = async move {
            let _ = result_tx.send(task.await);
        }
        .boxed();

        self.tx
            .send(job)
            .map_err(|_| ImgkeepError::Internal("serial queue is stopped".to_string()))?;

        result_rx
            .await
            .map_err(|_| ImgkeepError::Internal("queued task did not complete".to_string()))
    }

    /// Stop accepting work and wait for queued tasks to finish
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            error!("Serial queue worker failed: {}", e);
        }
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}
