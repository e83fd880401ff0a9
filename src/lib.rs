//! dhub client - batching, caching access to remote datasets
//!
//! Client for the dhub dataset service: datasets of elements (metadata plus
//! an opaque binary payload) listed in fixed-size pages.
//!
//! # Architecture
//!
//! - **Writes** are queued in a [`WriteCoalescer`] and flushed in bundles by
//!   a background scheduler (metadata before content)
//! - **Reads** go through a [`ConsistencyGate`] that waits for queued writes
//!   touching the same keys, then through the [`PageCache`] and the
//!   [`ParallelFetcher`]
//! - **Content** arrives as a shared [`ContentPromise`] resolved on first use
//!
//! # Example
//!
//! ```rust,ignore
//! use dhub_client::{ClientConfig, NewElement, Session};
//!
//! let session = Session::connect(ClientConfig::from_env()).await?;
//! let faces = session.dataset("faces").await?;
//!
//! // Queued, returns immediately
//! let mut element = faces.add_element(NewElement::new("face", "a face").with_content(png)).await?;
//! element.set_tag(Some("pose"), "frontal").await?;
//!
//! // Waits for the queued content write before reading
//! let content = faces.get_by_key(element.id()).await?.get_content().await?;
//!
//! faces.close(false).await?;
//! ```

// Error types
pub mod error;

// Configuration
pub mod config;

// Wire types
pub mod types;

// Backend gateway
pub mod transport;

// Zip bundles for bulk content
pub mod bundle;

// Worker pools
pub mod pool;

// Deferred writes
pub mod updater;

// Read-side caching
pub mod cache;

// Segmented retrieval
pub mod fetch;

// Sessions, datasets, elements
pub mod client;

// Re-export error types
pub use error::{DhubError, Result};

// Re-export configuration
pub use config::{ClientConfig, PoolSizes};

// Re-export wire types
pub use types::{
    DatasetRecord, ElementData, ElementRecord, FilterOptions, ForkRequest, NewDataset, NewElement,
    ServerInfo, TokenInfo,
};

// Re-export transport
pub use transport::{HttpTransport, Query, RetryPolicy, Transport};

// Re-export pools
pub use pool::{Pools, WorkerPool};

// Re-export write path
pub use updater::{
    CoalescerConfig, CoalescerStats, CompletionRegistry, FlushOutcome, WriteCoalescer, WriteKind,
    WritePayload,
};

// Re-export read path
pub use cache::{ConsistencyGate, ContentPromise, PageCache};
pub use fetch::{FetchedElement, PageWindow, ParallelFetcher};

// Re-export client types
pub use client::{Dataset, Element, ElementStream, Session};
