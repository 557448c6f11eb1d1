//! Worker pool for subtask execution.
//!
//! The `WorkerPool` bounds how many subtasks run at once.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::mlog_debug;

/// Bounds concurrent subtasks with a semaphore.
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(2);
/// let value = pool.run("worker-0", async { Ok(1) }).await?;
/// ```
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl WorkerPool {
    /// Create a pool allowing `max_concurrent` workers (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Run `work` once a slot is free.
    pub async fn run<F, T>(&self, tag: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        mlog_debug!("[{}] worker slot acquired", tag);
        work.await
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
