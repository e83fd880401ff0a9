use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded retry around a single logical request
///
/// Used for page and segment fetches, never around a whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.base_backoff.saturating_mul(attempt as u32)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    warn!(what, attempt, max_attempts = self.max_attempts, error = %e, "Request failed, retrying");
                    tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl From<&crate::config::ClientConfig> for RetryPolicy {
    fn from(config: &crate::config::ClientConfig) -> Self {
        Self::new(config.retry_attempts)
    }
}
