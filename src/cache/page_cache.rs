use crate::error::{DhubError, Result};
use crate::types::FilterOptions;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Ordered element ids of one listing page
pub type PageKeys = Arc<[String]>;

struct PageStore {
    /// (filter cache key, page index) -> ids
    pages: HashMap<(String, usize), PageKeys>,
    last_reset: Instant,
}

/// Time-boxed cache translating ordinal positions into element ids.
///
/// Pages are cached per filter and page index. All partitions share one
/// clock: once the TTL has elapsed since the last reset the whole cache is
/// dropped. Page fetches run without holding the lock, so two readers
/// missing the same page may both fetch it.
pub struct PageCache {
    store: RwLock<PageStore>,
    page_size: usize,
    ttl: Duration,
}

impl PageCache {
    pub fn new(page_size: usize, ttl: Duration) -> Self {
        Self {
            store: RwLock::new(PageStore {
                pages: HashMap::new(),
                last_reset: Instant::now(),
            }),
            page_size: page_size.max(1),
            ttl,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Id at ordinal position `index` under `options`
    ///
    /// `fetch` is called with the page index on a miss.
    pub async fn key_for_index<F, Fut>(
        &self,
        index: usize,
        options: &FilterOptions,
        fetch: F,
    ) -> Result<String>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = Result<Vec<String>>>,
    {
        let page = index / self.page_size;
        let offset = index % self.page_size;

        let keys = self.page(options, page, fetch).await?;
        keys.get(offset).cloned().ok_or_else(|| {
            DhubError::NotFound(format!(
                "no element at index {} (page {} holds {})",
                index,
                page,
                keys.len()
            ))
        })
    }

    /// Ids of one page, fetched on a miss
    pub async fn page<F, Fut>(&self, options: &FilterOptions, page: usize, fetch: F) -> Result<PageKeys>
    where
        F: FnOnce(usize) -> Fut,
        Fut: Future<Output = Result<Vec<String>>>,
    {
        self.expire().await;

        let slot = (options.cache_key(), page);
        if let Some(keys) = self.store.read().await.pages.get(&slot) {
            return Ok(Arc::clone(keys));
        }

        debug!(page, filter = %slot.0, "Page cache miss");
        let keys: PageKeys = fetch(page).await?.into();

        self.store.write().await.pages.insert(slot, Arc::clone(&keys));
        Ok(keys)
    }

    /// Drop every cached page
    pub async fn invalidate(&self) {
        let mut store = self.store.write().await;
        store.pages.clear();
        store.last_reset = Instant::now();
    }

    /// Number of cached pages across all filters
    pub async fn len(&self) -> usize {
        self.store.read().await.pages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn expire(&self) {
        if self.store.read().await.last_reset.elapsed() <= self.ttl {
            return;
        }

        let mut store = self.store.write().await;
        if store.last_reset.elapsed() > self.ttl {
            debug!(pages = store.pages.len(), "Page cache expired");
            store.pages.clear();
            store.last_reset = Instant::now();
        }
    }
}
