//! Element: one record of a dataset

use super::dataset::Dataset;
use crate::cache::ContentPromise;
use crate::error::{DhubError, Result};
use crate::pool::join;
use crate::types::{ElementData, ElementRecord};
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::debug;

struct CachedContent {
    bytes: Bytes,
    at: Instant,
}

/// A dataset element with write-through metadata and lazily loaded content.
///
/// Setters write through immediately: with a coalescer the write is queued
/// and the call returns at once; reads of the same element through the
/// dataset wait for it.
pub struct Element {
    dataset: Dataset,
    id: String,
    data: ElementData,
    comments_count: u64,
    has_content: bool,
    content_promise: Option<ContentPromise>,
    cached_content: Option<CachedContent>,
}

impl Element {
    pub(crate) fn new(dataset: Dataset, record: ElementRecord, content: Option<ContentPromise>) -> Self {
        Self {
            dataset,
            id: record.id,
            data: record.data,
            comments_count: record.comments_count,
            has_content: record.has_content,
            content_promise: content,
            cached_content: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.data.title
    }

    pub fn description(&self) -> &str {
        &self.data.description
    }

    pub fn tags(&self) -> &[Value] {
        &self.data.tags
    }

    pub fn http_ref(&self) -> &str {
        &self.data.http_ref
    }

    pub fn comments_count(&self) -> u64 {
        self.comments_count
    }

    pub fn has_content(&self) -> bool {
        self.has_content
    }

    pub fn data(&self) -> &ElementData {
        &self.data
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub async fn set_title(&mut self, title: impl Into<String>) -> Result<()> {
        self.data.title = title.into();
        self.update().await
    }

    pub async fn set_description(&mut self, description: impl Into<String>) -> Result<()> {
        self.data.description = description.into();
        self.update().await
    }

    pub async fn set_tags(&mut self, tags: Vec<Value>) -> Result<()> {
        self.data.tags = tags;
        self.update().await
    }

    pub async fn set_ref(&mut self, http_ref: impl Into<String>) -> Result<()> {
        self.data.http_ref = http_ref.into();
        self.update().await
    }

    // ==================== Tags ====================

    /// Value of the tag called `name`
    ///
    /// Matches `{"name": value}` objects and `"name: value"` strings; a
    /// plain string tag equal to `name` yields itself.
    pub fn get_tag(&self, name: &str) -> Option<String> {
        self.data.tags.iter().find_map(|tag| match tag {
            Value::Object(fields) => fields.get(name).map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            }),
            Value::String(text) => match text.split_once(':') {
                Some((key, value)) if key.trim() == name => Some(value.trim_start().to_string()),
                Some(_) => None,
                None if text == name => Some(text.clone()),
                None => None,
            },
            _ => None,
        })
    }

    /// Set the tag called `name` and write the tags through.
    ///
    /// An existing tag keeps its shape (object or `"name: value"` string);
    /// a new one is appended as an object, or as a bare string when `name`
    /// is `None`. Returns whether an existing tag was replaced.
    pub async fn set_tag(&mut self, name: Option<&str>, value: &str) -> Result<bool> {
        let position = name.and_then(|name| {
            self.data.tags.iter().position(|tag| addresses(tag, name))
        });

        match (name, position) {
            (Some(name), Some(index)) => {
                let tag = &mut self.data.tags[index];
                if let Value::Object(fields) = tag {
                    fields.insert(name.to_string(), Value::String(value.to_string()));
                } else {
                    *tag = Value::String(format!("{}: {}", name, value));
                }
            }
            (Some(name), None) => {
                let mut fields = Map::new();
                fields.insert(name.to_string(), Value::String(value.to_string()));
                self.data.tags.push(Value::Object(fields));
            }
            (None, _) => self.data.tags.push(Value::String(value.to_string())),
        }

        self.update().await?;
        Ok(position.is_some())
    }

    // ==================== Content ====================

    fn cache_content(&mut self, bytes: Bytes) {
        self.cached_content = Some(CachedContent {
            bytes,
            at: Instant::now(),
        });
    }

    /// Element content, `None` when the element has none
    ///
    /// Resolves the attached promise on first access. Content is then
    /// served from memory until the cache TTL passes, after which it is
    /// fetched again.
    pub async fn get_content(&mut self) -> Result<Option<Bytes>> {
        if !self.has_content {
            return Ok(None);
        }

        if let Some(promise) = self.content_promise.take() {
            match promise.resolve(&self.id).await? {
                Some(bytes) => self.cache_content(bytes),
                None => debug!(id = %self.id, "Element missing from its content bundle"),
            }
        }

        let ttl = self.dataset.inner().ctx.config.cache_ttl;
        if let Some(cached) = &self.cached_content {
            if cached.at.elapsed() <= ttl {
                return Ok(Some(cached.bytes.clone()));
            }
        }
        self.cached_content = None;

        let bytes = self
            .dataset
            .inner()
            .fetcher
            .fetch_element_content(&self.id)
            .resolve(&self.id)
            .await?
            .ok_or_else(|| DhubError::NotFound(format!("content of element {}", self.id)))?;

        self.cache_content(bytes.clone());
        Ok(Some(bytes))
    }

    /// Replace the content. Returns `false` when it equals the cached
    /// content and nothing was written.
    pub async fn set_content(&mut self, content: impl Into<Bytes>) -> Result<bool> {
        let content = content.into();
        if self
            .cached_content
            .as_ref()
            .map_or(false, |cached| cached.bytes == content)
        {
            return Ok(false);
        }

        let inner = self.dataset.inner();
        match &inner.coalescer {
            Some(coalescer) => {
                coalescer.enqueue_content(&self.dataset.path("elements/content"), &self.id, content.clone())?;
            }
            None => {
                let transport = std::sync::Arc::clone(&inner.ctx.transport);
                let path = format!("{}/content", self.dataset.element_path(&self.id));
                let body = content.clone();
                join(inner.ctx.pools.upload.submit(async move {
                    transport.put_binary(&path, &[], body).await
                }))
                .await?;
            }
        }

        self.cache_content(content);
        self.has_content = true;
        self.content_promise = None;
        Ok(true)
    }

    // ==================== Sync ====================

    /// Write the metadata through
    pub async fn update(&mut self) -> Result<()> {
        let data = serde_json::to_value(&self.data)?;
        let inner = self.dataset.inner();

        // Patched metadata can move the element in or out of filtered pages
        if let Some(coalescer) = &inner.coalescer {
            coalescer.enqueue_metadata(&self.dataset.path("elements/bundle"), &self.id, data)?;
            inner.page_cache.invalidate().await;
            return Ok(());
        }

        inner
            .ctx
            .transport
            .patch_json(&self.dataset.element_path(&self.id), &[], Some(&data))
            .await?;
        inner.page_cache.invalidate().await;
        self.refresh().await
    }

    /// Re-read the element; drops cached content
    pub async fn refresh(&mut self) -> Result<()> {
        let inner = self.dataset.inner();
        inner.gate.ensure_metadata(&[self.id.as_str()]).await?;

        let value = inner
            .ctx
            .transport
            .get_json(&self.dataset.element_path(&self.id), &[], None)
            .await?;
        let record: ElementRecord = serde_json::from_value(value)?;

        self.data = record.data;
        self.comments_count = record.comments_count;
        self.has_content = record.has_content;
        self.cached_content = None;
        self.content_promise = None;
        Ok(())
    }
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Element")
            .field("id", &self.id)
            .field("data", &self.data)
            .field("has_content", &self.has_content)
            .finish()
    }
}

/// Whether `tag` is the tag called `name`
fn addresses(tag: &Value, name: &str) -> bool {
    match tag {
        Value::Object(fields) => fields.contains_key(name),
        Value::String(text) => text.split_once(':').map_or(text.as_str(), |(key, _)| key).trim() == name,
        _ => false,
    }
}
