//! Parallel retrieval of element metadata and content
//!
//! Key lists are split into page-sized segments, each fetched on the keys
//! pool; content for a segment is fetched in the background on the content
//! pool and handed out as a [`ContentPromise`].

use crate::bundle;
use crate::cache::{ConsistencyGate, ContentPromise};
use crate::error::Result;
use crate::pool::{join, Pools};
use crate::transport::{segment, RetryPolicy, Transport};
use crate::types::{ElementRecord, FilterOptions};
use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Element metadata plus its (possibly pending) content
#[derive(Debug, Clone)]
pub struct FetchedElement {
    pub record: ElementRecord,
    pub content: Option<ContentPromise>,
}

/// Segmented fetcher bound to one dataset
#[derive(Clone)]
pub struct ParallelFetcher {
    transport: Arc<dyn Transport>,
    pools: Pools,
    retry: RetryPolicy,
    gate: ConsistencyGate,
    url_prefix: String,
    page_size: usize,
}

impl ParallelFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        pools: Pools,
        retry: RetryPolicy,
        gate: ConsistencyGate,
        url_prefix: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            transport,
            pools,
            retry,
            gate,
            url_prefix: url_prefix.into(),
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn path(&self, tail: &str) -> String {
        format!("datasets/{}/{}", self.url_prefix, tail)
    }

    // =========================================================================
    // Segments
    // =========================================================================

    /// Fetch the elements for `keys`, preserving the order of the segments.
    ///
    /// Callers pass the metadata gate first. Any failing segment fails the
    /// whole call.
    pub async fn fetch_keys_segment(&self, keys: &[String]) -> Result<Vec<FetchedElement>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let handles: Vec<_> = keys
            .chunks(self.page_size)
            .map(|chunk| {
                let fetcher = self.clone();
                let ids = chunk.to_vec();
                self.pools.keys.submit(async move { fetcher.request_segment(ids).await })
            })
            .collect();

        debug!(keys = keys.len(), segments = handles.len(), "Fetching element segments");

        let mut elements = Vec::with_capacity(keys.len());
        for handle in handles {
            elements.extend(join(handle).await?);
        }
        Ok(elements)
    }

    async fn request_segment(&self, ids: Vec<String>) -> Result<Vec<FetchedElement>> {
        let records = self.request_records(&ids).await?;
        let content = self.fetch_content_segment(ids);
        Ok(records
            .into_iter()
            .map(|record| FetchedElement {
                record,
                content: Some(content.clone()),
            })
            .collect())
    }

    /// Element records for `ids`, in request order
    async fn request_records(&self, ids: &[String]) -> Result<Vec<ElementRecord>> {
        let path = self.path("elements/bundle");
        let body = json!({ "elements": ids });

        let value = self
            .retry
            .run("element segment", || self.transport.get_json(&path, &[], Some(&body)))
            .await?;
        let records: Vec<ElementRecord> = serde_json::from_value(value)?;

        if records.len() != ids.len() {
            warn!(requested = ids.len(), received = records.len(), "Segment size mismatch");
        }
        Ok(records)
    }

    /// Start fetching the content bundle for `ids` on the content pool.
    ///
    /// The fetch waits for queued content writes of `ids` before it hits the
    /// backend.
    pub fn fetch_content_segment(&self, ids: Vec<String>) -> ContentPromise {
        let fetcher = self.clone();
        ContentPromise::from_task(
            self.pools.content.submit(async move { fetcher.request_content(ids).await }),
        )
    }

    async fn request_content(&self, ids: Vec<String>) -> Result<HashMap<String, Bytes>> {
        self.gate.ensure_content(&ids).await?;

        let path = self.path("elements/content");
        let body = json!({ "elements": ids });
        let packet = self
            .retry
            .run("content segment", || self.transport.get_binary(&path, &[], Some(&body)))
            .await?;

        bundle::unpack(&packet)
    }

    /// Start fetching the content of a single element
    pub fn fetch_element_content(&self, id: &str) -> ContentPromise {
        let fetcher = self.clone();
        let id = id.to_string();
        ContentPromise::from_task(self.pools.content.submit(async move {
            fetcher.gate.ensure_content(&[id.as_str()]).await?;

            let path = fetcher.path(&format!("elements/{}/content", segment(&id)));
            let content = fetcher
                .retry
                .run("element content", || fetcher.transport.get_binary(&path, &[], None))
                .await?;

            Ok(HashMap::from([(id, content)]))
        }))
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// One listing page under `options`
    pub async fn list_page(&self, page: usize, options: &FilterOptions) -> Result<Vec<ElementRecord>> {
        let path = self.path("elements");
        let query = [("page", page.to_string())];
        let body = json!({ "options": options.as_value() });

        let value = self
            .retry
            .run("element page", || self.transport.get_json(&path, &query, Some(&body)))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Ids on one listing page
    pub async fn page_keys(&self, page: usize, options: &FilterOptions) -> Result<Vec<String>> {
        let records = self.list_page(page, options).await?;
        Ok(records.into_iter().map(|record| record.id).collect())
    }

    /// Iterate `page_count` pages with the next page always in flight
    pub fn window(&self, options: FilterOptions, page_count: usize, cache_content: bool) -> PageWindow {
        // Capacity 1 plus reserving before each fetch keeps exactly one page
        // ahead of the consumer.
        let (tx, rx) = mpsc::channel(1);
        let fetcher = self.clone();

        let producer = tokio::spawn(async move {
            for page in 0..page_count {
                let Ok(permit) = tx.reserve().await else {
                    break;
                };

                let listing = {
                    let pool = fetcher.pools.keys.clone();
                    let fetcher = fetcher.clone();
                    let options = options.clone();
                    pool.submit(async move { fetcher.list_page(page, &options).await })
                };

                let records = match join(listing).await {
                    Ok(records) => records,
                    Err(e) => {
                        permit.send(Err(e));
                        break;
                    }
                };
                if records.is_empty() {
                    debug!(page, "Empty page, iteration finished");
                    break;
                }

                // A listed page may predate queued metadata writes
                let records = match fetcher.settled(records).await {
                    Ok(records) => records,
                    Err(e) => {
                        permit.send(Err(e));
                        break;
                    }
                };

                let content = cache_content.then(|| {
                    fetcher.fetch_content_segment(records.iter().map(|r| r.id.clone()).collect())
                });
                let elements = records
                    .into_iter()
                    .map(|record| FetchedElement {
                        record,
                        content: content.clone(),
                    })
                    .collect();

                permit.send(Ok(elements));
            }
        });

        PageWindow { rx, producer }
    }

    /// Wait for queued metadata writes to `records` and re-read them if any
    /// were pending
    async fn settled(&self, records: Vec<ElementRecord>) -> Result<Vec<ElementRecord>> {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        if !self.gate.settle_metadata(&ids).await? {
            return Ok(records);
        }

        debug!(keys = ids.len(), "Re-reading page after pending metadata writes");
        self.request_records(&ids).await
    }
}

/// Consumer side of a windowed iteration
pub struct PageWindow {
    rx: mpsc::Receiver<Result<Vec<FetchedElement>>>,
    producer: JoinHandle<()>,
}

impl PageWindow {
    /// Next page, or `None` once iteration is over
    ///
    /// A failed page is yielded once and ends the iteration.
    pub async fn next_page(&mut self) -> Option<Result<Vec<FetchedElement>>> {
        self.rx.recv().await
    }
}

impl Drop for PageWindow {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
