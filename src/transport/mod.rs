//! Transport gateway to the dhub backend
//!
//! Every component talks to the backend through the [`Transport`] trait so
//! the HTTP layer can be swapped for an in-memory service in tests.

mod http;
mod retry;

pub use http::HttpTransport;
pub use retry::RetryPolicy;

use crate::error::Result;
use bytes::Bytes;
use serde_json::Value;

/// Query parameters for a request (the access token is added by the transport)
pub type Query<'a> = &'a [(&'a str, String)];

/// Logical requests against the backend
///
/// Paths are relative to the backend root (`datasets/{prefix}/elements`).
/// Implementations retry rate-limited requests themselves and fail with
/// [`DhubError::Transport`](crate::DhubError::Transport) on any other
/// non-success status.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// GET returning a JSON document
    async fn get_json(&self, path: &str, query: Query<'_>, body: Option<&Value>) -> Result<Value>;

    /// GET returning raw bytes
    async fn get_binary(&self, path: &str, query: Query<'_>, body: Option<&Value>)
        -> Result<Bytes>;

    /// POST a JSON body
    async fn post_json(&self, path: &str, query: Query<'_>, body: Option<&Value>) -> Result<Value>;

    /// PATCH a JSON body
    async fn patch_json(&self, path: &str, query: Query<'_>, body: Option<&Value>)
        -> Result<Value>;

    /// PUT raw bytes
    async fn put_binary(&self, path: &str, query: Query<'_>, body: Bytes) -> Result<Value>;

    /// DELETE with an optional JSON body
    async fn delete_json(&self, path: &str, query: Query<'_>, body: Option<&Value>)
        -> Result<Value>;
}

/// Percent-encode a key for use as a single path segment
pub(crate) fn segment(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}
