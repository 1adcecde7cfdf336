//! Bounded stage pool
//!
//! Runs a stage's blocking tasks with at most `limit` in flight. Results come
//! back in submission order.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Error type for pool execution
#[derive(Debug, Error)]
pub enum PoolError {
    /// A task panicked or was cancelled
    #[error("Stage task {index} did not complete: {source}")]
    Join {
        index: usize,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("Stage pool semaphore closed")]
    Closed,
}

/// Run every task on the blocking thread pool, `limit` at a time.
///
/// A limit of 0 is treated as 1.
pub async fn run_pool<T, F>(limit: u32, tasks: Vec<F>) -> Result<Vec<T>, PoolError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1) as usize));
    let handles: Vec<_> = tasks
        .into_iter()
        .map(|task| {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| PoolError::Closed)?;
                tokio::task::spawn_blocking(task)
                    .await
                    .map_err(|source| PoolError::Join { index: 0, source })
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (index, handle) in handles.into_iter().enumerate() {
        let result = handle
            .await
            .map_err(|source| PoolError::Join { index, source })?;
        let value = result.map_err(|e| match e {
            PoolError::Join { source, .. } => PoolError::Join { index, source },
            other => other,
        })?;
        results.push(value);
    }
    Ok(results)
}
