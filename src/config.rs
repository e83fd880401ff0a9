//! Client configuration
//!
//! Defaults follow the behaviour of the hosted dhub backend. Every field can
//! be overridden from `DHUB_*` environment variables via [`ClientConfig::from_env`].

use crate::error::{DhubError, Result};
use std::time::Duration;

/// Sizes of the worker pools owned by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSizes {
    /// Key/metadata segment fetches
    pub keys: usize,
    /// Content bundle fetches
    pub content: usize,
    /// Coalesced write flushes
    pub flush: usize,
    /// Direct content uploads (used when the coalescer is disabled)
    pub upload: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            keys: 4,
            content: 4,
            flush: 4,
            upload: 4,
        }
    }
}

/// Configuration for a client session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL (trailing slash is stripped)
    pub base_url: String,
    /// Access token, sent as the `_tok` query parameter
    pub token: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Attempts for a single page/segment request before giving up
    pub retry_attempts: usize,
    /// Pause before resending a rate-limited (HTTP 429) request
    pub rate_limit_backoff: Duration,
    /// Tick of the background write scheduler
    pub flush_interval: Duration,
    /// Upper bound for waiting on pending writes before a read
    pub await_timeout: Duration,
    /// Lifetime of cached list pages and element content
    pub cache_ttl: Duration,
    /// Worker pool sizes
    pub pools: PoolSizes,
    /// Route element writes through the batching updater
    pub use_coalescer: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            token: String::new(),
            request_timeout: Duration::from_secs(30),
            retry_attempts: 3,
            rate_limit_backoff: Duration::from_secs(2),
            flush_interval: Duration::from_secs(1),
            await_timeout: Duration::from_secs(100),
            cache_ttl: Duration::from_secs(60),
            pools: PoolSizes::default(),
            use_coalescer: true,
        }
    }
}

impl ClientConfig {
    /// Default configuration for the given backend and token
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            ..Default::default()
        }
    }

    /// Configuration for interactive use (fast flush, short waits)
    pub fn for_interactive(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            await_timeout: Duration::from_secs(30),
            ..Self::new(base_url, token)
        }
    }

    /// Configuration for bulk uploads (wider pools, patient waits)
    pub fn for_bulk(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            await_timeout: Duration::from_secs(600),
            pools: PoolSizes {
                keys: 4,
                content: 8,
                flush: 8,
                upload: 8,
            },
            ..Self::new(base_url, token)
        }
    }

    /// Create config from environment or defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            base_url: std::env::var("DHUB_BACKEND_URL").unwrap_or(defaults.base_url),
            token: std::env::var("DHUB_TOKEN").unwrap_or(defaults.token),
            request_timeout: env_secs("DHUB_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout),
            retry_attempts: env_parse("DHUB_RETRY_ATTEMPTS").unwrap_or(defaults.retry_attempts),
            rate_limit_backoff: env_millis("DHUB_RATE_LIMIT_BACKOFF_MS")
                .unwrap_or(defaults.rate_limit_backoff),
            flush_interval: env_millis("DHUB_FLUSH_INTERVAL_MS").unwrap_or(defaults.flush_interval),
            await_timeout: env_secs("DHUB_AWAIT_TIMEOUT_SECS").unwrap_or(defaults.await_timeout),
            cache_ttl: env_secs("DHUB_CACHE_TTL_SECS").unwrap_or(defaults.cache_ttl),
            pools: PoolSizes {
                keys: env_parse("DHUB_KEYS_WORKERS").unwrap_or(defaults.pools.keys),
                content: env_parse("DHUB_CONTENT_WORKERS").unwrap_or(defaults.pools.content),
                flush: env_parse("DHUB_FLUSH_WORKERS").unwrap_or(defaults.pools.flush),
                upload: env_parse("DHUB_UPLOAD_WORKERS").unwrap_or(defaults.pools.upload),
            },
            use_coalescer: env_parse("DHUB_USE_COALESCER").unwrap_or(defaults.use_coalescer),
        }
    }

    /// Base URL without the trailing slash
    pub fn api_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_url().is_empty() {
            return Err(DhubError::Config("backend URL must not be empty".into()));
        }
        if self.retry_attempts == 0 {
            return Err(DhubError::Config("retry_attempts must be at least 1".into()));
        }
        let pools = &self.pools;
        if pools.keys == 0 || pools.content == 0 || pools.flush == 0 || pools.upload == 0 {
            return Err(DhubError::Config("worker pools need at least one worker".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(DhubError::Config("flush_interval must be positive".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}
