use crate::error::{DhubError, Result};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Content of a segment, keyed by element id
pub type ContentBundle = Arc<HashMap<String, Bytes>>;

/// Deferred content bundle shared by every element of a segment.
///
/// The underlying fetch runs at most once no matter how many clones are
/// awaited; a failed fetch hands the same error to every reader.
#[derive(Clone)]
pub struct ContentPromise {
    inner: Shared<BoxFuture<'static, Result<ContentBundle>>>,
}

impl ContentPromise {
    pub fn new<F>(fetch: F) -> Self
    where
        F: Future<Output = Result<HashMap<String, Bytes>>> + Send + 'static,
    {
        Self {
            inner: fetch.map(|result| result.map(Arc::new)).boxed().shared(),
        }
    }

    /// Promise over a task already running in a pool
    pub fn from_task(handle: JoinHandle<Result<HashMap<String, Bytes>>>) -> Self {
        Self::new(async move { handle.await? })
    }

    /// Promise that is already resolved
    pub fn ready(bundle: HashMap<String, Bytes>) -> Self {
        Self::new(futures::future::ready(Ok(bundle)))
    }

    /// Promise that resolves to `error`
    pub fn failed(error: DhubError) -> Self {
        Self::new(futures::future::ready(Err(error)))
    }

    /// Whole bundle
    pub async fn bundle(&self) -> Result<ContentBundle> {
        self.inner.clone().await
    }

    /// Payload of one element, if the bundle carries it
    pub async fn resolve(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.bundle().await?.get(key).cloned())
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl std::fmt::Debug for ContentPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentPromise")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
