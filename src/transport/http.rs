//! HTTP transport for the dhub backend

use super::{Query, Transport};
use crate::config::ClientConfig;
use crate::error::{DhubError, Result};
use bytes::Bytes;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

enum Payload<'a> {
    Json(Option<&'a Value>),
    Binary(Bytes),
}

/// reqwest-backed [`Transport`]
///
/// The access token travels as the `_tok` query parameter. Rate-limited
/// requests (HTTP 429) are resent after a fixed pause until the backend
/// accepts them; any status other than 200/201 becomes an error carrying
/// the response body.
#[derive(Clone)]
pub struct HttpTransport {
    api_url: String,
    token: String,
    client: Client,
    rate_limit_backoff: Duration,
}

impl HttpTransport {
    /// Create a transport from the client configuration
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DhubError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_url: config.api_url().to_string(),
            token: config.token.clone(),
            client,
            rate_limit_backoff: config.rate_limit_backoff,
        })
    }

    /// Backend root this transport talks to
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: Query<'_>,
        payload: Payload<'_>,
    ) -> Result<reqwest::Response> {
        let url = self.url(path);
        let mut params: Vec<(&str, &str)> = query.iter().map(|(k, v)| (*k, v.as_str())).collect();
        params.push(("_tok", self.token.as_str()));

        loop {
            let mut request = self.client.request(method.clone(), &url).query(&params);
            request = match &payload {
                Payload::Json(Some(body)) => request.json(body),
                Payload::Json(None) => request,
                Payload::Binary(bytes) => request.body(bytes.clone()),
            };

            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!(%method, path, backoff_ms = self.rate_limit_backoff.as_millis() as u64, "Rate limited, retrying");
                tokio::time::sleep(self.rate_limit_backoff).await;
                continue;
            }

            debug!(%method, path, status = status.as_u16(), "Backend responded");

            if status == StatusCode::OK || status == StatusCode::CREATED {
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::NOT_FOUND {
                let message = if body.is_empty() { path.to_string() } else { body };
                return Err(DhubError::NotFound(message));
            }

            return Err(DhubError::Transport {
                status: status.as_u16(),
                message: body,
            });
        }
    }

    async fn json(response: reqwest::Response) -> Result<Value> {
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn get_json(&self, path: &str, query: Query<'_>, body: Option<&Value>) -> Result<Value> {
        let response = self.send(Method::GET, path, query, Payload::Json(body)).await?;
        Self::json(response).await
    }

    async fn get_binary(
        &self,
        path: &str,
        query: Query<'_>,
        body: Option<&Value>,
    ) -> Result<Bytes> {
        let response = self.send(Method::GET, path, query, Payload::Json(body)).await?;
        Ok(response.bytes().await?)
    }

    async fn post_json(&self, path: &str, query: Query<'_>, body: Option<&Value>) -> Result<Value> {
        let response = self.send(Method::POST, path, query, Payload::Json(body)).await?;
        Self::json(response).await
    }

    async fn patch_json(
        &self,
        path: &str,
        query: Query<'_>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let response = self.send(Method::PATCH, path, query, Payload::Json(body)).await?;
        Self::json(response).await
    }

    async fn put_binary(&self, path: &str, query: Query<'_>, body: Bytes) -> Result<Value> {
        let response = self.send(Method::PUT, path, query, Payload::Binary(body)).await?;
        Self::json(response).await
    }

    async fn delete_json(
        &self,
        path: &str,
        query: Query<'_>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let response = self.send(Method::DELETE, path, query, Payload::Json(body)).await?;
        Self::json(response).await
    }
}
