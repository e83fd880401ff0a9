//! Session against a dhub backend

use super::dataset::Dataset;
use crate::config::ClientConfig;
use crate::error::{DhubError, Result};
use crate::pool::Pools;
use crate::transport::{segment, HttpTransport, Transport};
use crate::types::{DatasetRecord, ForkRequest, NewDataset, ServerInfo, TokenInfo};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Everything a dataset handle needs from its session
pub(crate) struct Context {
    pub config: ClientConfig,
    pub transport: Arc<dyn Transport>,
    pub pools: Pools,
    pub server_info: ServerInfo,
    pub token_info: TokenInfo,
}

impl Context {
    pub fn page_size(&self) -> usize {
        self.server_info.page_size.max(1)
    }
}

struct Slot {
    record: DatasetRecord,
    /// Opened lazily, kept across refreshes while the dataset still exists
    handle: Option<Dataset>,
}

/// Connection to a backend under one token
///
/// # Example
///
/// ```rust,no_run
/// use dhub_client::{ClientConfig, Session};
///
/// # async fn example() -> dhub_client::Result<()> {
/// let session = Session::connect(ClientConfig::new("https://dhub.example.org", "my-token")).await?;
///
/// let faces = session.dataset("faces").await?;
/// let first = faces.get(0).await?;
/// println!("{} of {} elements: {}", faces.url_prefix(), faces.len(), first.title());
///
/// faces.close(false).await?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    ctx: Arc<Context>,
    datasets: RwLock<BTreeMap<String, Slot>>,
}

impl Session {
    /// Connect over HTTP
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport).await
    }

    /// Connect through any transport
    pub async fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let token_path = format!("tokens/{}", segment(&config.token));
        let (server, token) = tokio::try_join!(
            transport.get_json("server", &[], None),
            transport.get_json(&token_path, &[], None),
        )?;
        let server_info: ServerInfo = serde_json::from_value(server)?;
        let token_info: TokenInfo = serde_json::from_value(token)?;

        info!(
            api_url = config.api_url(),
            page_size = server_info.page_size,
            prefix = %token_info.prefix,
            "Connected to dhub backend"
        );

        let pools = Pools::new(&config.pools);
        let session = Self {
            ctx: Arc::new(Context {
                config,
                transport,
                pools,
                server_info,
                token_info,
            }),
            datasets: RwLock::new(BTreeMap::new()),
        };
        session.refresh().await?;
        Ok(session)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.ctx.server_info
    }

    pub fn token_info(&self) -> &TokenInfo {
        &self.ctx.token_info
    }

    pub fn page_size(&self) -> usize {
        self.ctx.page_size()
    }

    // ==================== Listing ====================

    /// Re-read the datasets visible to the token
    pub async fn refresh(&self) -> Result<()> {
        let listing = self.ctx.transport.get_json("datasets", &[], None).await?;
        let records: Vec<DatasetRecord> = serde_json::from_value(listing)?;

        let mut datasets = self.datasets.write().await;
        let mut previous = std::mem::take(&mut *datasets);
        for record in records {
            let handle = previous
                .remove(&record.url_prefix)
                .and_then(|slot| slot.handle);
            datasets.insert(record.url_prefix.clone(), Slot { record, handle });
        }

        debug!(datasets = datasets.len(), "Dataset listing refreshed");
        Ok(())
    }

    /// Url prefixes of the visible datasets, sorted
    pub async fn keys(&self) -> Vec<String> {
        self.datasets.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.datasets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// First url prefix containing `query`
    pub async fn find_closest(&self, query: &str) -> Option<String> {
        self.datasets
            .read()
            .await
            .keys()
            .find(|prefix| prefix.contains(query))
            .cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.resolve(name).await.is_some()
    }

    /// Exact url prefix, or the closest match
    async fn resolve(&self, name: &str) -> Option<String> {
        if self.datasets.read().await.contains_key(name) {
            return Some(name.to_string());
        }
        self.find_closest(name).await
    }

    /// Open a dataset by url prefix or partial name
    ///
    /// The same handle is returned on every call, so reads through it see
    /// writes queued through it.
    pub async fn dataset(&self, name: &str) -> Result<Dataset> {
        let prefix = self
            .resolve(name)
            .await
            .ok_or_else(|| DhubError::NotFound(format!("dataset {}", name)))?;

        let mut datasets = self.datasets.write().await;
        let slot = datasets
            .get_mut(&prefix)
            .ok_or_else(|| DhubError::NotFound(format!("dataset {}", prefix)))?;

        if let Some(handle) = &slot.handle {
            return Ok(handle.clone());
        }

        let handle = Dataset::open(Arc::clone(&self.ctx), slot.record.clone());
        slot.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Open the dataset at position `index` in prefix order
    pub async fn dataset_at(&self, index: usize) -> Result<Dataset> {
        let prefix = self
            .keys()
            .await
            .into_iter()
            .nth(index)
            .ok_or_else(|| DhubError::NotFound(format!("dataset #{}", index)))?;
        self.dataset(&prefix).await
    }

    // ==================== Mutations ====================

    /// Create a dataset and open it
    pub async fn add_dataset(&self, dataset: NewDataset) -> Result<Dataset> {
        let body = serde_json::to_value(&dataset)?;
        let created = self.ctx.transport.post_json("datasets", &[], Some(&body)).await?;
        let prefix = prefix_of(&created).unwrap_or(dataset.url_prefix);

        info!(url_prefix = %prefix, "Dataset created");
        self.refresh().await?;
        self.dataset(&prefix).await
    }

    /// Delete a dataset by url prefix or partial name
    pub async fn remove_dataset(&self, name: &str) -> Result<()> {
        let prefix = self
            .resolve(name)
            .await
            .ok_or_else(|| DhubError::NotFound(format!("dataset {}", name)))?;

        let opened = self
            .datasets
            .write()
            .await
            .get_mut(&prefix)
            .and_then(|slot| slot.handle.take());
        if let Some(handle) = opened {
            handle.close(true).await?;
        }

        self.ctx
            .transport
            .delete_json(&format!("datasets/{}", prefix), &[], None)
            .await?;

        info!(url_prefix = %prefix, "Dataset removed");
        self.refresh().await
    }

    /// Make another token's dataset visible under this token
    pub async fn link_dataset(&self, url_prefix: &str) -> Result<()> {
        if self.datasets.read().await.contains_key(url_prefix) {
            return Ok(());
        }

        let path = format!("tokens/{}/link/{}", segment(&self.ctx.config.token), url_prefix);
        self.ctx.transport.post_json(&path, &[], None).await?;
        self.refresh().await
    }

    /// Fork a dataset into this token's namespace and open the copy
    pub async fn fork_dataset(&self, name: &str, new_prefix: &str, request: ForkRequest) -> Result<Dataset> {
        let source = self.dataset(name).await?;
        let prefix = source.fork(new_prefix, request, None).await?;
        self.refresh().await?;
        self.dataset(&prefix).await
    }

    /// Stop every opened dataset's writer and release the worker pools
    ///
    /// With `force` queued writes are discarded instead of flushed.
    pub async fn close(&self, force: bool) -> Result<()> {
        let handles: Vec<Dataset> = self
            .datasets
            .read()
            .await
            .values()
            .filter_map(|slot| slot.handle.clone())
            .collect();

        for handle in handles {
            handle.close(force).await?;
        }
        self.ctx.pools.close();
        Ok(())
    }
}

/// `url_prefix` of a create/fork response
pub(crate) fn prefix_of(response: &Value) -> Option<String> {
    response
        .get("url_prefix")
        .and_then(Value::as_str)
        .map(str::to_string)
}
