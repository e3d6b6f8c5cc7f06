//! A fixed-size pool of workers draining a bounded job queue.
//!
//! Connection attempts, completion callbacks and server-side method invocations all run on a
//! [`WorkerPool`]. Submitting never blocks: when the queue is full the job is rejected with
//! [`RpcError::Rejected`] rather than buffered.
//!
//! # Example
//!
//! ```
//! use courier::pool::WorkerPool;
//!
//! # tokio_test::block_on(async {
//! let pool = WorkerPool::new("example", 4, 128);
//! let (tx, rx) = tokio::sync::oneshot::channel();
//! pool.try_submit(async move {
//!     let _ = tx.send(42);
//! })?;
//! assert_eq!(rx.await.unwrap(), 42);
//! # Ok::<(), courier::error::RpcError>(())
//! # });
//! ```

use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{error, warn};

use crate::error::RpcError;

type Job = BoxFuture<'static, ()>;

/// A cloneable handle to a bounded pool of worker tasks.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: &'static str,
    tx: mpsc::Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks sharing a queue of `queue_capacity` jobs.
    ///
    /// # Panics
    ///
    /// Panics if `workers` or `queue_capacity` is 0, or if called outside a Tokio runtime.
    pub fn new(name: &'static str, workers: usize, queue_capacity: usize) -> Self {
        assert_ne!(workers, 0, "worker pool must have at least one worker");
        let (tx, rx) = mpsc::channel::<Job>(queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                            error!(pool = name, panic = %panic_message(&*panic), "job panicked");
                        }
                    }
                })
            })
            .collect();

        WorkerPool {
            inner: Arc::new(PoolInner {
                name,
                tx,
                workers: Mutex::new(workers),
            }),
        }
    }

    /// Queues a job without waiting.
    ///
    /// Returns [`RpcError::Rejected`] if the queue is full, or [`RpcError::Stopped`] if the pool
    /// has been shut down.
    pub fn try_submit<F>(&self, job: F) -> Result<(), RpcError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .tx
            .try_send(job.boxed())
            .map_err(|err| match err {
                TrySendError::Full(_) => {
                    warn!(pool = self.inner.name, "queue is full, rejecting job");
                    RpcError::Rejected
                }
                TrySendError::Closed(_) => RpcError::Stopped,
            })
    }

    /// Returns the number of jobs waiting in the queue.
    pub fn queued(&self) -> usize {
        self.inner.tx.max_capacity() - self.inner.tx.capacity()
    }

    /// Aborts all workers. Queued jobs are dropped and later submissions fail.
    pub fn shutdown(&self) {
        let workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(|err| err.into_inner()),
        );
        for worker in workers {
            worker.abort();
        }
    }

    /// Returns `true` once every worker has exited.
    pub fn is_shutdown(&self) -> bool {
        self.inner.tx.is_closed()
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("queued", &self.queued())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::sync::{oneshot, Notify};

    use super::*;

    #[tokio::test]
    async fn runs_submitted_jobs() {
        let pool = WorkerPool::new("test", 4, 64);
        let count = Arc::new(AtomicUsize::new(0));
        let mut receivers = Vec::new();
        for _ in 0..32 {
            let count = count.clone();
            let (tx, rx) = oneshot::channel();
            receivers.push(rx);
            pool.try_submit(async move {
                count.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            })
            .unwrap();
        }
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 32);
    }

    #[tokio::test]
    async fn rejects_when_queue_is_full() {
        let pool = WorkerPool::new("test", 1, 1);
        let gate = Arc::new(Notify::new());
        let (started_tx, started_rx) = oneshot::channel();

        let blocker = gate.clone();
        pool.try_submit(async move {
            let _ = started_tx.send(());
            blocker.notified().await;
        })
        .unwrap();
        started_rx.await.unwrap();

        // The single worker is busy, so one job fits in the queue and the next is rejected.
        pool.try_submit(async {}).unwrap();
        assert!(matches!(pool.try_submit(async {}), Err(RpcError::Rejected)));

        gate.notify_one();
    }

    #[tokio::test]
    async fn survives_panicking_jobs() {
        let pool = WorkerPool::new("test", 1, 8);
        pool.try_submit(async { panic!("boom") }).unwrap();
        let (tx, rx) = oneshot::channel();
        pool.try_submit(async move {
            let _ = tx.send(());
        })
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_later_jobs() {
        let pool = WorkerPool::new("test", 2, 8);
        pool.shutdown();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !pool.is_shutdown() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(matches!(pool.try_submit(async {}), Err(RpcError::Stopped)));
    }
}
