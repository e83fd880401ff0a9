use crate::error::Result;
use crate::updater::{WriteCoalescer, WriteKind};
use std::sync::Arc;
use std::time::Duration;

/// Read-your-writes barrier in front of every read path.
///
/// Before keys are read, any queued write touching them in the matching
/// namespace is awaited. Without a coalescer writes are synchronous and
/// the gate is always open.
#[derive(Clone)]
pub struct ConsistencyGate {
    coalescer: Option<Arc<WriteCoalescer>>,
    timeout: Duration,
}

impl ConsistencyGate {
    pub fn new(coalescer: Option<Arc<WriteCoalescer>>, timeout: Duration) -> Self {
        Self { coalescer, timeout }
    }

    /// Gate with nothing to wait for
    pub fn open() -> Self {
        Self::new(None, Duration::ZERO)
    }

    pub fn coalescer(&self) -> Option<&Arc<WriteCoalescer>> {
        self.coalescer.as_ref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for queued metadata writes of `keys`
    pub async fn ensure_metadata<K: AsRef<str>>(&self, keys: &[K]) -> Result<()> {
        self.ensure(WriteKind::Metadata, keys).await
    }

    /// Wait for queued content writes of `keys`
    pub async fn ensure_content<K: AsRef<str>>(&self, keys: &[K]) -> Result<()> {
        self.ensure(WriteKind::Content, keys).await
    }

    /// Like [`ensure_metadata`](Self::ensure_metadata), reporting whether
    /// anything had to be waited for
    pub async fn settle_metadata<K: AsRef<str>>(&self, keys: &[K]) -> Result<bool> {
        self.wait(WriteKind::Metadata, keys).await
    }

    async fn ensure<K: AsRef<str>>(&self, kind: WriteKind, keys: &[K]) -> Result<()> {
        self.wait(kind, keys).await.map(|_| ())
    }

    async fn wait<K: AsRef<str>>(&self, kind: WriteKind, keys: &[K]) -> Result<bool> {
        match &self.coalescer {
            Some(coalescer) if coalescer.is_pending(kind, keys) => {
                coalescer.await_flush(kind, keys, self.timeout).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl std::fmt::Debug for ConsistencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyGate")
            .field("coalescer", &self.coalescer.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}
