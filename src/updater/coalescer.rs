//! Write Coalescer - batched element writes with priority lanes
//!
//! Element mutations are queued and return immediately. A background
//! scheduler drains the lanes on a fixed tick, groups queued writes into
//! page-sized batches and flushes each batch as one bundle request per
//! endpoint.
//!
//! ## Lanes
//!
//! 1. **Metadata** - element patches, flushed as `{"elements": {id: data}}`
//! 2. **Content** - element payloads, flushed as a zip bundle
//!
//! A pass drains metadata completely before it starts on content, and drops
//! back to metadata as soon as new metadata writes show up.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let coalescer = WriteCoalescer::start(transport, pools.flush.clone(), CoalescerConfig::new(20));
//!
//! coalescer.enqueue("datasets/ipazc/faces/elements/content", "5a1f", WritePayload::Content(bytes))?;
//! coalescer.await_flush(WriteKind::Content, &["5a1f".to_string()], timeout).await?;
//!
//! coalescer.stop(true).await?;
//! ```

use super::registry::{outcome_of, CompletionRegistry, FlushOutcome, Ticket, WriteKind};
use crate::bundle;
use crate::error::{DhubError, Result};
use crate::pool::{join, WorkerPool};
use crate::transport::Transport;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a write coalescer
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Largest batch handed to a single flush job
    pub batch_limit: usize,
    /// Scheduler tick
    pub flush_interval: Duration,
}

impl CoalescerConfig {
    /// Batches bounded by the backend page size, ticking once a second
    pub fn new(page_size: usize) -> Self {
        Self {
            batch_limit: page_size.max(1),
            flush_interval: Duration::from_secs(1),
        }
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }
}

// =============================================================================
// Write Tasks
// =============================================================================

/// Payload of a queued write
#[derive(Debug, Clone, PartialEq)]
pub enum WritePayload {
    /// Partial element metadata
    Metadata(Value),
    /// Element content
    Content(Bytes),
}

impl WritePayload {
    pub fn kind(&self) -> WriteKind {
        match self {
            WritePayload::Metadata(_) => WriteKind::Metadata,
            WritePayload::Content(_) => WriteKind::Content,
        }
    }
}

/// A single queued write, consumed exactly once by the scheduler
#[derive(Debug)]
pub struct WriteTask {
    pub endpoint: String,
    pub key: String,
    pub payload: WritePayload,
    ticket: Ticket,
}

impl WriteTask {
    pub fn kind(&self) -> WriteKind {
        self.payload.kind()
    }
}

/// Stop request observed by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Running,
    /// Keep flushing until both lanes are empty
    Drain,
    /// Discard whatever is still queued
    Discard,
}

// =============================================================================
// Statistics
// =============================================================================

/// Coalescer counters since start
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoalescerStats {
    pub pending_tasks: usize,
    pub metadata_queued: usize,
    pub content_queued: usize,
    pub batches_flushed: u64,
    pub tasks_flushed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
}

#[derive(Default)]
struct Counters {
    batches_flushed: AtomicU64,
    tasks_flushed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
}

// =============================================================================
// Shared State
// =============================================================================

/// State shared by the public handle, the scheduler and flush jobs
struct Shared {
    registry: CompletionRegistry,
    transport: Arc<dyn Transport>,
    flush_pool: WorkerPool,
    /// Queued (not yet taken) tasks per lane
    depth: [AtomicUsize; 2],
    counters: Counters,
}

impl Shared {
    fn queued(&self, kind: WriteKind) -> usize {
        self.depth[kind.index()].load(Ordering::SeqCst)
    }

    /// Whether a lane served before `kind` has queued work
    fn higher_priority_waiting(&self, kind: WriteKind) -> bool {
        WriteKind::BY_PRIORITY
            .iter()
            .take_while(|lane| **lane != kind)
            .any(|lane| self.queued(*lane) > 0)
    }

    /// Send one batch, one request per endpoint
    async fn send_batch(&self, kind: WriteKind, batch: &[WriteTask]) -> Result<()> {
        let mut by_endpoint: BTreeMap<&str, Vec<&WriteTask>> = BTreeMap::new();
        for task in batch {
            by_endpoint.entry(task.endpoint.as_str()).or_default().push(task);
        }

        for (endpoint, tasks) in by_endpoint {
            match kind {
                WriteKind::Metadata => {
                    let mut elements = Map::new();
                    for task in &tasks {
                        if let WritePayload::Metadata(data) = &task.payload {
                            elements.insert(task.key.clone(), data.clone());
                        }
                    }
                    let body = json!({ "elements": elements });
                    self.transport.patch_json(endpoint, &[], Some(&body)).await?;
                }
                WriteKind::Content => {
                    // Later writes for a key replace earlier ones.
                    let mut entries: BTreeMap<&str, &[u8]> = BTreeMap::new();
                    for task in &tasks {
                        if let WritePayload::Content(data) = &task.payload {
                            entries.insert(task.key.as_str(), data.as_ref());
                        }
                    }
                    let body = bundle::pack(entries)?;
                    self.transport.put_binary(endpoint, &[], body).await?;
                }
            }
            debug!(kind = kind.as_str(), endpoint, batch = tasks.len(), "Bundle sent");
        }

        Ok(())
    }

    fn complete(&self, kind: WriteKind, tasks: &[(String, Ticket)], outcome: &FlushOutcome) {
        let count = tasks.len() as u64;
        match outcome {
            FlushOutcome::Flushed => {
                self.counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
                self.counters.tasks_flushed.fetch_add(count, Ordering::Relaxed);
            }
            FlushOutcome::Failed(_) => {
                self.counters.tasks_failed.fetch_add(count, Ordering::Relaxed);
            }
            FlushOutcome::Cancelled => {
                self.counters.tasks_cancelled.fetch_add(count, Ordering::Relaxed);
            }
        }
        self.registry.complete(
            kind,
            tasks.iter().map(|(key, ticket)| (key.as_str(), *ticket)),
            outcome,
        );
    }
}

fn receipts(batch: &[WriteTask]) -> Vec<(String, Ticket)> {
    batch.iter().map(|task| (task.key.clone(), task.ticket)).collect()
}

// =============================================================================
// Write Coalescer
// =============================================================================

/// Batching write queue with per-key completion tracking.
///
/// Dropping the coalescer without calling [`stop`](Self::stop) lets the
/// scheduler drain what is queued and exit on its own.
pub struct WriteCoalescer {
    shared: Arc<Shared>,
    lanes: [mpsc::UnboundedSender<WriteTask>; 2],
    stop_tx: watch::Sender<StopMode>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl WriteCoalescer {
    /// Create the coalescer and spawn its scheduler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
        flush_pool: WorkerPool,
        config: CoalescerConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            registry: CompletionRegistry::new(),
            transport,
            flush_pool,
            depth: [AtomicUsize::new(0), AtomicUsize::new(0)],
            counters: Counters::default(),
        });

        let (metadata_tx, metadata_rx) = mpsc::unbounded_channel();
        let (content_tx, content_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(StopMode::Running);

        info!(
            batch_limit = config.batch_limit,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "WriteCoalescer started"
        );

        let scheduler = Scheduler {
            shared: Arc::clone(&shared),
            lanes: [metadata_rx, content_rx],
            stop_rx,
            stop_open: true,
            config,
        };
        let handle = tokio::spawn(scheduler.run());

        Self {
            shared,
            lanes: [metadata_tx, content_tx],
            stop_tx,
            scheduler: Mutex::new(Some(handle)),
        }
    }

    // =========================================================================
    // Queuing
    // =========================================================================

    /// Queue a write for `key` against `endpoint`. Never blocks.
    pub fn enqueue(
        &self,
        endpoint: impl Into<String>,
        key: impl Into<String>,
        payload: WritePayload,
    ) -> Result<()> {
        let kind = payload.kind();
        let key = key.into();

        if *self.stop_tx.borrow() != StopMode::Running {
            return Err(DhubError::Cancelled(format!(
                "coalescer is stopping, {} write for {} rejected",
                kind.as_str(),
                key
            )));
        }

        let ticket = self.shared.registry.register(kind, &key);
        let task = WriteTask {
            endpoint: endpoint.into(),
            key,
            payload,
            ticket,
        };

        self.shared.depth[kind.index()].fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(task)) = self.lanes[kind.index()].send(task) {
            self.shared.depth[kind.index()].fetch_sub(1, Ordering::SeqCst);
            self.shared.complete(kind, &receipts(std::slice::from_ref(&task)), &FlushOutcome::Cancelled);
            return Err(DhubError::Cancelled(format!(
                "scheduler has exited, {} write for {} rejected",
                kind.as_str(),
                task.key
            )));
        }

        Ok(())
    }

    /// Queue a metadata patch
    pub fn enqueue_metadata(&self, endpoint: &str, key: &str, data: Value) -> Result<()> {
        self.enqueue(endpoint, key, WritePayload::Metadata(data))
    }

    /// Queue a content upload
    pub fn enqueue_content(&self, endpoint: &str, key: &str, content: Bytes) -> Result<()> {
        self.enqueue(endpoint, key, WritePayload::Content(content))
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Whether any of `keys` has an unflushed write of `kind`
    pub fn is_pending<K: AsRef<str>>(&self, kind: WriteKind, keys: &[K]) -> bool {
        self.shared.registry.is_pending(kind, keys)
    }

    /// Wait until every pending write of `kind` for `keys` has completed.
    ///
    /// Keys without a queued write are ignored. On timeout the entries of
    /// `keys` are dropped from the registry before the error is returned.
    pub async fn await_flush<K: AsRef<str>>(
        &self,
        kind: WriteKind,
        keys: &[K],
        timeout: Duration,
    ) -> Result<()> {
        let waiters = self.shared.registry.subscribe(kind, keys);
        if waiters.is_empty() {
            return Ok(());
        }

        let count = waiters.len();
        debug!(kind = kind.as_str(), keys = count, "Waiting for pending writes");

        let all = futures::future::join_all(
            waiters
                .into_iter()
                .map(|(key, waiter)| async move { (key, outcome_of(waiter).await) }),
        );

        match tokio::time::timeout(timeout, all).await {
            Ok(outcomes) => {
                for (key, outcome) in outcomes {
                    outcome.into_result(&key)?;
                }
                Ok(())
            }
            Err(_) => {
                self.shared.registry.forget(kind, keys);
                warn!(kind = kind.as_str(), keys = count, timeout_ms = timeout.as_millis() as u64, "Timed out waiting for writes");
                Err(DhubError::Timeout(format!(
                    "{} {} write(s) still pending after {:?}",
                    count,
                    kind.as_str(),
                    timeout
                )))
            }
        }
    }

    // =========================================================================
    // Status and Statistics
    // =========================================================================

    /// Writes queued or in flight
    pub fn pending_tasks(&self) -> usize {
        self.shared.registry.pending()
    }

    pub fn queues_busy(&self) -> bool {
        self.pending_tasks() > 0
    }

    /// Wait until nothing is queued or in flight, logging progress
    pub async fn wait_idle(&self, poll: Duration) {
        let mut last_logged: Option<Instant> = None;
        while self.queues_busy() {
            if last_logged.map_or(true, |at| at.elapsed() >= Duration::from_secs(5)) {
                info!(pending = self.pending_tasks(), "Waiting for queued writes to flush");
                last_logged = Some(Instant::now());
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn stats(&self) -> CoalescerStats {
        let counters = &self.shared.counters;
        CoalescerStats {
            pending_tasks: self.pending_tasks(),
            metadata_queued: self.shared.queued(WriteKind::Metadata),
            content_queued: self.shared.queued(WriteKind::Content),
            batches_flushed: counters.batches_flushed.load(Ordering::Relaxed),
            tasks_flushed: counters.tasks_flushed.load(Ordering::Relaxed),
            tasks_failed: counters.tasks_failed.load(Ordering::Relaxed),
            tasks_cancelled: counters.tasks_cancelled.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the scheduler and wait for it to exit.
    ///
    /// With `drain_pending` the scheduler keeps flushing until both lanes
    /// are empty; without it, queued writes are discarded and their waiters
    /// see [`DhubError::Cancelled`]. Calling `stop` again is a no-op.
    pub async fn stop(&self, drain_pending: bool) -> Result<()> {
        let mode = if drain_pending { StopMode::Drain } else { StopMode::Discard };
        self.stop_tx.send_if_modified(|current| {
            if *current == StopMode::Running || mode == StopMode::Discard {
                let changed = *current != mode;
                *current = mode;
                changed
            } else {
                false
            }
        });

        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(handle) = handle {
            info!(drain_pending, pending = self.pending_tasks(), "Stopping write coalescer");
            handle.await?;
        }
        Ok(())
    }
}

impl Drop for WriteCoalescer {
    fn drop(&mut self) {
        self.stop_tx.send_if_modified(|current| {
            if *current == StopMode::Running {
                *current = StopMode::Drain;
                true
            } else {
                false
            }
        });
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Background task owning the receiving end of both lanes
struct Scheduler {
    shared: Arc<Shared>,
    lanes: [mpsc::UnboundedReceiver<WriteTask>; 2],
    stop_rx: watch::Receiver<StopMode>,
    /// False once every coalescer handle is gone
    stop_open: bool,
    config: CoalescerConfig,
}

impl Scheduler {
    async fn run(mut self) {
        let period = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.stop_open {
                let closed = tokio::select! {
                    _ = ticker.tick() => false,
                    changed = self.stop_rx.changed() => changed.is_err(),
                };
                if closed {
                    self.stop_open = false;
                }
            } else {
                ticker.tick().await;
            }

            match self.mode() {
                StopMode::Running => self.run_pass().await,
                StopMode::Drain => {
                    self.run_pass().await;
                    if self.lanes_empty() {
                        break;
                    }
                }
                StopMode::Discard => {
                    self.discard_all();
                    break;
                }
            }
        }

        info!(pending = self.shared.registry.pending(), "Write scheduler stopped");
    }

    fn mode(&self) -> StopMode {
        *self.stop_rx.borrow()
    }

    fn lanes_empty(&self) -> bool {
        WriteKind::BY_PRIORITY.iter().all(|kind| self.shared.queued(*kind) == 0)
    }

    /// One pass over the lanes in priority order
    async fn run_pass(&mut self) {
        'pass: loop {
            for kind in WriteKind::BY_PRIORITY {
                if self.mode() == StopMode::Discard {
                    return;
                }
                if self.shared.higher_priority_waiting(kind) || self.drain_lane(kind).await {
                    tokio::task::yield_now().await;
                    continue 'pass;
                }
            }
            return;
        }
    }

    /// Drain one lane into batches and wait for all of them.
    ///
    /// Returns true when draining was cut short by higher-priority work or a
    /// discard request.
    async fn drain_lane(&mut self, kind: WriteKind) -> bool {
        let limit = self.config.batch_limit;
        let mut batch: Vec<WriteTask> = Vec::new();
        let mut in_flight = Vec::new();
        let mut interrupted = false;

        loop {
            if self.shared.higher_priority_waiting(kind) || self.mode() == StopMode::Discard {
                interrupted = true;
                break;
            }
            match self.lanes[kind.index()].try_recv() {
                Ok(task) => {
                    self.shared.depth[kind.index()].fetch_sub(1, Ordering::SeqCst);
                    batch.push(task);
                    if batch.len() >= limit {
                        in_flight.push(self.submit(kind, std::mem::take(&mut batch)));
                    }
                }
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            in_flight.push(self.submit(kind, batch));
        }

        if !in_flight.is_empty() {
            debug!(kind = kind.as_str(), batches = in_flight.len(), "Waiting for lane batches");
        }
        for (tasks, handle) in in_flight {
            if let Err(e) = join(handle).await {
                // The flush job never ran to completion
                error!(kind = kind.as_str(), batch = tasks.len(), error = %e, "Flush job aborted");
                self.shared.complete(kind, &tasks, &FlushOutcome::Failed(e));
            }
        }

        interrupted
    }

    /// Hand a batch to the flush pool
    fn submit(
        &self,
        kind: WriteKind,
        batch: Vec<WriteTask>,
    ) -> (Vec<(String, Ticket)>, JoinHandle<Result<()>>) {
        let tasks = receipts(&batch);
        let shared = Arc::clone(&self.shared);

        let handle = self.shared.flush_pool.submit(async move {
            let start = Instant::now();
            let outcome = match shared.send_batch(kind, &batch).await {
                Ok(()) => {
                    debug!(
                        kind = kind.as_str(),
                        batch = batch.len(),
                        duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                        "Batch flushed"
                    );
                    FlushOutcome::Flushed
                }
                Err(e) => {
                    error!(kind = kind.as_str(), batch = batch.len(), error = %e, "Batch flush failed");
                    FlushOutcome::Failed(e)
                }
            };
            shared.complete(kind, &receipts(&batch), &outcome);
            Ok(())
        });

        (tasks, handle)
    }

    /// Drop everything still queued, releasing waiters with `Cancelled`
    fn discard_all(&mut self) {
        for kind in WriteKind::BY_PRIORITY {
            let lane = &mut self.lanes[kind.index()];
            lane.close();

            let mut discarded = Vec::new();
            while let Ok(task) = lane.try_recv() {
                self.shared.depth[kind.index()].fetch_sub(1, Ordering::SeqCst);
                discarded.push(task);
            }

            if !discarded.is_empty() {
                warn!(kind = kind.as_str(), discarded = discarded.len(), "Queued writes discarded");
                self.shared.complete(kind, &receipts(&discarded), &FlushOutcome::Cancelled);
            }
        }
    }
}
