//! Dataset handle: element lookup, iteration and bulk mutation

use super::element::Element;
use super::session::{prefix_of, Context};
use crate::cache::{ConsistencyGate, PageCache};
use crate::error::{DhubError, Result};
use crate::fetch::{FetchedElement, PageWindow, ParallelFetcher};
use crate::transport::{segment, RetryPolicy};
use crate::types::{DatasetRecord, ElementRecord, FilterOptions, ForkRequest, NewElement};
use crate::updater::{CoalescerConfig, WriteCoalescer};
use futures::Stream;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

pub(crate) struct DatasetInner {
    pub ctx: Arc<Context>,
    pub url_prefix: String,
    record: RwLock<DatasetRecord>,
    pub page_cache: PageCache,
    pub fetcher: ParallelFetcher,
    pub coalescer: Option<Arc<WriteCoalescer>>,
    pub gate: ConsistencyGate,
}

/// Handle to one remote dataset
///
/// Cheap to clone; clones share the page cache and the write coalescer.
#[derive(Clone)]
pub struct Dataset {
    inner: Arc<DatasetInner>,
}

impl Dataset {
    pub(crate) fn open(ctx: Arc<Context>, record: DatasetRecord) -> Self {
        let page_size = ctx.page_size();
        let config = &ctx.config;

        let coalescer = config.use_coalescer.then(|| {
            Arc::new(WriteCoalescer::start(
                Arc::clone(&ctx.transport),
                ctx.pools.flush.clone(),
                CoalescerConfig::new(page_size).with_flush_interval(config.flush_interval),
            ))
        });
        let gate = ConsistencyGate::new(coalescer.clone(), config.await_timeout);
        let fetcher = ParallelFetcher::new(
            Arc::clone(&ctx.transport),
            ctx.pools.clone(),
            RetryPolicy::from(config),
            gate.clone(),
            record.url_prefix.clone(),
            page_size,
        );
        let page_cache = PageCache::new(page_size, config.cache_ttl);

        debug!(url_prefix = %record.url_prefix, coalescer = coalescer.is_some(), "Dataset opened");

        Self {
            inner: Arc::new(DatasetInner {
                url_prefix: record.url_prefix.clone(),
                record: RwLock::new(record),
                ctx,
                page_cache,
                fetcher,
                coalescer,
                gate,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &DatasetInner {
        &self.inner
    }

    fn record_ref(&self) -> RwLockReadGuard<'_, DatasetRecord> {
        self.inner.record.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_mut(&self) -> RwLockWriteGuard<'_, DatasetRecord> {
        self.inner.record.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `datasets/{prefix}/{tail}`
    pub(crate) fn path(&self, tail: &str) -> String {
        format!("datasets/{}/{}", self.inner.url_prefix, tail)
    }

    pub(crate) fn element_path(&self, id: &str) -> String {
        self.path(&format!("elements/{}", segment(id)))
    }

    fn root_path(&self) -> String {
        format!("datasets/{}", self.inner.url_prefix)
    }

    // ==================== Metadata ====================

    pub fn url_prefix(&self) -> &str {
        &self.inner.url_prefix
    }

    /// Snapshot of the dataset metadata
    pub fn record(&self) -> DatasetRecord {
        self.record_ref().clone()
    }

    pub fn title(&self) -> String {
        self.record_ref().title.clone()
    }

    pub fn description(&self) -> String {
        self.record_ref().description.clone()
    }

    pub fn reference(&self) -> String {
        self.record_ref().reference.clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.record_ref().tags.clone()
    }

    pub fn size(&self) -> u64 {
        self.record_ref().size
    }

    pub fn fork_count(&self) -> u64 {
        self.record_ref().fork_count
    }

    pub fn fork_father(&self) -> Option<String> {
        self.record_ref().fork_father.clone()
    }

    pub fn comments_count(&self) -> u64 {
        self.record_ref().comments_count
    }

    /// Element count as of the last refresh
    pub fn len(&self) -> usize {
        self.record_ref().elements_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.record_mut().title = title.into();
    }

    pub fn set_description(&self, description: impl Into<String>) {
        self.record_mut().description = description.into();
    }

    pub fn set_tags(&self, tags: Vec<String>) {
        self.record_mut().tags = tags;
    }

    pub fn set_reference(&self, reference: impl Into<String>) {
        self.record_mut().reference = reference.into();
    }

    /// Push local metadata changes to the backend
    pub async fn update(&self) -> Result<()> {
        let body = self.record_ref().patch_body();
        self.inner
            .ctx
            .transport
            .patch_json(&self.root_path(), &[], Some(&body))
            .await?;
        Ok(())
    }

    /// Re-read metadata and counts; drops cached pages
    pub async fn refresh(&self) -> Result<()> {
        let value = self.inner.ctx.transport.get_json(&self.root_path(), &[], None).await?;
        let record: DatasetRecord = serde_json::from_value(value)?;
        *self.record_mut() = record;

        self.inner.page_cache.invalidate().await;
        Ok(())
    }

    /// Re-read the dataset size in bytes
    pub async fn update_size(&self) -> Result<u64> {
        let value = self
            .inner
            .ctx
            .transport
            .get_json(&self.path("size"), &[], None)
            .await?;
        let size = value
            .as_u64()
            .ok_or_else(|| DhubError::Serialization(format!("unexpected size response: {}", value)))?;
        self.record_mut().size = size;
        Ok(size)
    }

    // ==================== Lookup ====================

    fn element(&self, fetched: FetchedElement) -> Element {
        Element::new(self.clone(), fetched.record, fetched.content)
    }

    /// Element id at ordinal `index` under `options`
    pub async fn key_for_index(&self, index: usize, options: &FilterOptions) -> Result<String> {
        let fetcher = &self.inner.fetcher;
        self.inner
            .page_cache
            .key_for_index(index, options, |page| fetcher.page_keys(page, options))
            .await
    }

    /// Ids for `positions`; a filtered listing simply ends early
    async fn keys_at(&self, positions: Vec<usize>, options: &FilterOptions) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(positions.len());
        for position in positions {
            match self.key_for_index(position, options).await {
                Ok(id) => ids.push(id),
                Err(DhubError::NotFound(_)) if !options.is_none() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(ids)
    }

    /// Element at ordinal `index`; negative indexes count from the end
    pub async fn get(&self, index: i64) -> Result<Element> {
        let len = self.len() as i64;
        let position = if index < 0 { index + len } else { index };
        if position < 0 || position >= len {
            return Err(DhubError::NotFound(format!(
                "index {} out of range for {} elements",
                index, len
            )));
        }

        self.get_range(position, Some(position + 1), 1, &FilterOptions::none())
            .await?
            .pop()
            .ok_or_else(|| DhubError::NotFound(format!("element at index {}", index)))
    }

    /// Element at ordinal `index` of the filtered listing
    pub async fn get_filtered(&self, index: i64, options: &FilterOptions) -> Result<Element> {
        if options.is_none() {
            return self.get(index).await;
        }
        if index < 0 {
            return Err(DhubError::InvalidArgument(
                "negative indexes are not allowed with filter options; use iter() instead".into(),
            ));
        }

        self.get_range(index, Some(index + 1), 1, options)
            .await?
            .pop()
            .ok_or_else(|| DhubError::NotFound(format!("filtered element at index {}", index)))
    }

    /// Elements in `start..stop` by `step`
    ///
    /// Without options, negative bounds count from the end and `stop`
    /// defaults to the element count. With options, negative bounds are
    /// rejected and the range ends where the filtered listing ends.
    pub async fn get_range(
        &self,
        start: i64,
        stop: Option<i64>,
        step: usize,
        options: &FilterOptions,
    ) -> Result<Vec<Element>> {
        let positions = resolve_range(start, stop, step, self.len(), !options.is_none())?;
        let ids = self.keys_at(positions, options).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.inner.gate.ensure_metadata(&ids).await?;
        let fetched = self.inner.fetcher.fetch_keys_segment(&ids).await?;
        Ok(fetched.into_iter().map(|f| self.element(f)).collect())
    }

    /// Element by id
    pub async fn get_by_key(&self, id: &str) -> Result<Element> {
        self.inner.gate.ensure_metadata(&[id]).await?;

        let value = self
            .inner
            .ctx
            .transport
            .get_json(&self.element_path(id), &[], None)
            .await?;
        let record: ElementRecord = serde_json::from_value(value)?;
        let content = record
            .has_content
            .then(|| self.inner.fetcher.fetch_element_content(id));

        Ok(Element::new(self.clone(), record, content))
    }

    /// Element ids: of one listing page, or of the whole dataset
    pub async fn keys(&self, page: Option<usize>) -> Result<Vec<String>> {
        match page {
            Some(page) => self.inner.fetcher.page_keys(page, &FilterOptions::none()).await,
            None => {
                let positions = (0..self.len()).collect();
                self.keys_at(positions, &FilterOptions::none()).await
            }
        }
    }

    /// Iterate all elements matching `options`, one page ahead
    ///
    /// With `cache_content` each page's content bundle is fetched in the
    /// background while the page is consumed.
    pub fn iter(&self, options: FilterOptions, cache_content: bool) -> ElementStream {
        let page_size = self.inner.fetcher.page_size();
        let page_count = (self.len() + page_size - 1) / page_size;

        ElementStream {
            dataset: self.clone(),
            window: self.inner.fetcher.window(options, page_count, cache_content),
            buffered: VecDeque::new(),
        }
    }

    // ==================== Mutations ====================

    /// Create an element; its content (if any) is written afterwards
    pub async fn add_element(&self, element: NewElement) -> Result<Element> {
        let body = serde_json::to_value(&element.data)?;
        let created = self
            .inner
            .ctx
            .transport
            .post_json(&self.path("elements"), &[], Some(&body))
            .await?;
        let id = id_of(&created).ok_or_else(|| {
            DhubError::Serialization(format!("create response carries no element id: {}", created))
        })?;

        self.refresh().await?;
        let mut added = self.get_by_key(&id).await?;
        if let Some(content) = element.content {
            added.set_content(content).await?;
        }

        debug!(url_prefix = self.url_prefix(), id = %id, "Element added");
        Ok(added)
    }

    /// Create many elements with one request; contents are written afterwards
    pub async fn add_elements(&self, elements: Vec<NewElement>) -> Result<Vec<Element>> {
        if elements.is_empty() {
            return Ok(Vec::new());
        }

        let (data, contents): (Vec<_>, Vec<_>) =
            elements.into_iter().map(|e| (e.data, e.content)).unzip();
        let body = json!({ "elements": serde_json::to_value(&data)? });

        let created = self
            .inner
            .ctx
            .transport
            .post_json(&self.path("elements/bundle"), &[], Some(&body))
            .await?;
        let records: Vec<ElementRecord> = serde_json::from_value(created)?;
        self.refresh().await?;

        let mut added = Vec::with_capacity(records.len());
        for (record, content) in records.into_iter().zip(contents) {
            let mut element = Element::new(self.clone(), record, None);
            if let Some(content) = content {
                element.set_content(content).await?;
            }
            added.push(element);
        }

        info!(url_prefix = self.url_prefix(), count = added.len(), "Elements added");
        Ok(added)
    }

    /// Delete one element by id
    pub async fn delete_key(&self, id: &str) -> Result<()> {
        self.settle(&[id]).await?;
        self.inner
            .ctx
            .transport
            .delete_json(&self.element_path(id), &[], None)
            .await?;
        self.refresh().await
    }

    /// Delete the elements in `start..stop` by `step`, returning how many
    pub async fn delete_range(
        &self,
        start: i64,
        stop: Option<i64>,
        step: usize,
        options: &FilterOptions,
    ) -> Result<usize> {
        let positions = resolve_range(start, stop, step, self.len(), !options.is_none())?;
        let ids = self.keys_at(positions, options).await?;

        match ids.as_slice() {
            [] => return Err(DhubError::NotFound(format!("no elements in {}..{:?}", start, stop))),
            [id] => {
                self.settle(&ids).await?;
                self.inner
                    .ctx
                    .transport
                    .delete_json(&self.element_path(id), &[], None)
                    .await?;
            }
            _ => {
                self.settle(&ids).await?;
                self.delete_bundle(&ids).await?;
            }
        }

        self.refresh().await?;
        Ok(ids.len())
    }

    /// Delete every element, one page-sized bundle at a time
    pub async fn clear(&self) -> Result<usize> {
        let ids = self.keys(None).await?;
        self.settle(&ids).await?;

        for chunk in ids.chunks(self.inner.fetcher.page_size()) {
            self.delete_bundle(chunk).await?;
        }

        info!(url_prefix = self.url_prefix(), deleted = ids.len(), "Dataset cleared");
        self.refresh().await?;
        Ok(ids.len())
    }

    async fn delete_bundle(&self, ids: &[String]) -> Result<()> {
        let body = json!({ "elements": ids });
        self.inner
            .ctx
            .transport
            .delete_json(&self.path("elements/bundle"), &[], Some(&body))
            .await?;
        Ok(())
    }

    /// Wait for queued writes to `ids` so they cannot land after a delete
    async fn settle<K: AsRef<str>>(&self, ids: &[K]) -> Result<()> {
        self.inner.gate.ensure_metadata(ids).await?;
        self.inner.gate.ensure_content(ids).await
    }

    /// Fork into `new_prefix`, owned by `destination_token` (default: ours)
    ///
    /// Returns the url prefix of the copy.
    pub async fn fork(
        &self,
        new_prefix: &str,
        request: ForkRequest,
        destination_token: Option<&str>,
    ) -> Result<String> {
        let token = destination_token.unwrap_or(self.inner.ctx.config.token.as_str());

        let mut body = serde_json::to_value(&request)?;
        if let Value::Object(fields) = &mut body {
            fields.insert("url_prefix".into(), Value::String(new_prefix.to_string()));
        }

        let created = self
            .inner
            .ctx
            .transport
            .post_json(&self.path(&format!("fork/{}", segment(token))), &[], Some(&body))
            .await?;

        let prefix = prefix_of(&created).unwrap_or_else(|| new_prefix.to_string());
        info!(source = self.url_prefix(), fork = %prefix, "Dataset forked");
        Ok(prefix)
    }

    // ==================== Writes ====================

    pub fn coalescer(&self) -> Option<&Arc<WriteCoalescer>> {
        self.inner.coalescer.as_ref()
    }

    /// Queued writes not yet flushed
    pub fn pending_writes(&self) -> usize {
        self.inner.coalescer.as_ref().map_or(0, |c| c.pending_tasks())
    }

    /// Wait until every queued write has flushed, then optionally refresh
    /// the dataset size
    pub async fn sync(&self, update_size: bool) -> Result<()> {
        if let Some(coalescer) = &self.inner.coalescer {
            coalescer.wait_idle(self.inner.ctx.config.flush_interval).await;
        }
        if update_size {
            self.update_size().await?;
        }
        Ok(())
    }

    /// Stop the write coalescer
    ///
    /// With `force` queued writes are discarded and their waiters cancelled;
    /// otherwise they are flushed first.
    pub async fn close(&self, force: bool) -> Result<()> {
        match &self.inner.coalescer {
            Some(coalescer) => coalescer.stop(!force).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record_ref();
        f.debug_struct("Dataset")
            .field("url_prefix", &record.url_prefix)
            .field("title", &record.title)
            .field("elements", &record.elements_count)
            .finish()
    }
}

/// Elements of a dataset in listing order
pub struct ElementStream {
    dataset: Dataset,
    window: PageWindow,
    buffered: VecDeque<Element>,
}

impl ElementStream {
    /// Next element; `None` after the last page
    pub async fn next(&mut self) -> Option<Result<Element>> {
        loop {
            if let Some(element) = self.buffered.pop_front() {
                return Some(Ok(element));
            }
            match self.window.next_page().await? {
                Ok(page) => {
                    let dataset = &self.dataset;
                    self.buffered.extend(page.into_iter().map(|f| dataset.element(f)));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Drain the remaining elements
    pub async fn collect(mut self) -> Result<Vec<Element>> {
        let mut elements = Vec::new();
        while let Some(element) = self.next().await {
            elements.push(element?);
        }
        Ok(elements)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Element>> {
        futures::stream::unfold(self, |mut elements| async move {
            let next = elements.next().await?;
            Some((next, elements))
        })
    }
}

/// Element id from a create response (a bare id or an element document)
fn id_of(response: &Value) -> Option<String> {
    match response {
        Value::String(id) => Some(id.clone()),
        Value::Object(fields) => fields.get("_id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Ordinal positions selected by `start..stop` stepping by `step`
fn resolve_range(
    start: i64,
    stop: Option<i64>,
    step: usize,
    len: usize,
    filtered: bool,
) -> Result<Vec<usize>> {
    if step == 0 {
        return Err(DhubError::InvalidArgument("slice step cannot be zero".into()));
    }
    let len = len as i64;

    if filtered {
        if start < 0 || stop.map_or(false, |stop| stop < 0) {
            return Err(DhubError::InvalidArgument(
                "negative indexes are not allowed with filter options; use iter() instead".into(),
            ));
        }
        let stop = stop.unwrap_or(len);
        return Ok((start..stop).step_by(step).map(|i| i as usize).collect());
    }

    let clamp = |i: i64| if i < 0 { (i + len).max(0) } else { i.min(len) };
    let start = clamp(start);
    let stop = stop.map_or(len, clamp);
    Ok((start..stop).step_by(step).map(|i| i as usize).collect())
}
