//! # Worker pool
//!
//! A fixed set of tokio tasks pulling [`AsyncJob`]s from one shared, unbounded channel.
//! Connections use it to drain their outbound queues and, when asynchronous reads are
//! enabled, to run the message handler off the read loop.
//!
//! Submitting never waits for a free executor. Every job runs exactly once; jobs complete in
//! no particular order.
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::{mpsc, Mutex};

use crate::Result;

type Task = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A unit of work bound to the argument it will be called with.
pub struct AsyncJob {
    task: Task,
}

impl AsyncJob {
    /// Creates a job that will call `f(args)` on one of the pool's executors.
    ///
    /// `f` is invoked on the executor, not here, so a panic inside it is contained there too.
    pub fn new<A, F, Fut>(args: A, f: F) -> Self
    where
        A: Send + 'static,
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            task: Box::new(move || async move { f(args).await }.boxed()),
        }
    }

    async fn run(self) {
        match AssertUnwindSafe((self.task)()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(_err)) => {
                #[cfg(feature = "logging")]
                log::debug!("job failed: {}", _err);
            }
            Err(_) => {
                #[cfg(feature = "logging")]
                log::debug!("job panicked");
            }
        }
    }
}

/// Cloneable handle to a pool of executors.
///
/// The executors stop once every handle is dropped and the submitted jobs are done.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    sender: mpsc::UnboundedSender<AsyncJob>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` executors (at least one) on the current tokio runtime.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<AsyncJob>();
        let receiver = Arc::new(Mutex::new(receiver));

        for _ in 0..size {
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    match job {
                        Some(job) => job.run().await,
                        None => break,
                    }
                }
            });
        }

        Self {
            inner: Arc::new(PoolInner { sender, size }),
        }
    }

    /// Submits a job.
    pub fn add_job(&self, job: AsyncJob) {
        if self.inner.sender.send(job).is_err() {
            // only happens once the runtime dropped the executors
            #[cfg(feature = "logging")]
            log::debug!("worker pool is shut down, job dropped");
        }
    }

    /// Number of executors.
    pub fn size(&self) -> usize {
        self.inner.size
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.inner.size)
            .finish()
    }
}
