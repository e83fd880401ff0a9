//! Bounded worker pools
//!
//! A session owns one pool per kind of work so large content transfers
//! never queue in front of cheap key lookups:
//! - keys: metadata segment fetches and page listings
//! - content: bundled content downloads
//! - flush: coalesced write batches
//! - upload: direct content uploads when writes are not coalesced

use crate::error::{DhubError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Fixed-size pool of concurrently running tasks
///
/// Tasks are spawned immediately but wait for a permit before running;
/// permits are handed out in submission order.
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        debug!(pool = name, size, "Worker pool created");
        Self {
            name,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Submit a task, returning a handle to its result
    pub fn submit<F, T>(&self, task: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let name = self.name;
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| DhubError::Internal(format!("{} pool is closed", name)))?;
            task.await
        })
    }

    /// Stop handing out permits; queued tasks fail, running tasks finish
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Tasks currently holding a permit
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits().min(self.size)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Await a pool task, folding a panicked or aborted task into the error type
pub async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await?
}

/// Pools owned by one session
#[derive(Clone)]
pub struct Pools {
    pub keys: WorkerPool,
    pub content: WorkerPool,
    pub flush: WorkerPool,
    pub upload: WorkerPool,
}

impl Pools {
    pub fn new(sizes: &crate::config::PoolSizes) -> Self {
        Self {
            keys: WorkerPool::new("keys", sizes.keys),
            content: WorkerPool::new("content", sizes.content),
            flush: WorkerPool::new("flush", sizes.flush),
            upload: WorkerPool::new("upload", sizes.upload),
        }
    }

    pub fn close(&self) {
        self.keys.close();
        self.content.close();
        self.flush.close();
        self.upload.close();
    }
}
