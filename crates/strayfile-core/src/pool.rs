//! Bounded worker pool for concurrent fan-out.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Outcome of [`WorkerPool::join_all`].
#[derive(Debug)]
pub struct PoolResults<T, E> {
    /// Values of tasks that returned `Ok`, in completion order.
    pub completed: Vec<T>,
    /// Errors of tasks that returned `Err`, in completion order.
    pub failed: Vec<E>,
    /// Tasks that panicked or were aborted.
    pub panicked: usize,
}

impl<T, E> PoolResults<T, E> {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.panicked == 0
    }
}

/// Runs at most `limit` tasks at a time and collects their results.
///
/// `submit` waits for a free slot before spawning, so a producer is throttled
/// to the pool's pace instead of queueing unbounded work.
pub struct WorkerPool<T, E> {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Result<T, E>>,
    limit: usize,
}

impl<T, E> WorkerPool<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create a pool running at most `limit` tasks at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            tasks: JoinSet::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Spawn an async task once a slot is free.
    pub async fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
    }

    /// Run a blocking closure on the blocking thread pool once a slot is free.
    pub async fn submit_blocking<F>(&mut self, task: F)
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();
        self.tasks.spawn_blocking(move || {
            let _permit = permit;
            task()
        });
    }

    /// Number of tasks not yet joined.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every submitted task and collect the results.
    pub async fn join_all(mut self) -> PoolResults<T, E> {
        let mut results = PoolResults {
            completed: Vec::new(),
            failed: Vec::new(),
            panicked: 0,
        };
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(value)) => results.completed.push(value),
                Ok(Err(err)) => results.failed.push(err),
                Err(join_err) => {
                    tracing::error!(error = %join_err, "worker task did not complete");
                    results.panicked += 1;
                }
            }
        }
        results
    }
}
