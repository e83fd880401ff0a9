//! Per-key completion bookkeeping for queued writes
//!
//! Each queued write registers its key under a namespace. A key stays
//! "pending" until the last queued write for it has been flushed (or
//! discarded). Waiters subscribe to a one-shot broadcast that fires with the
//! outcome; the entry is removed from the map at the moment it fires.

use crate::error::DhubError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

/// Namespace of a queued write; also its flush priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    /// Element metadata patches (flushed first)
    Metadata = 0,
    /// Element content uploads
    Content = 1,
}

impl WriteKind {
    /// Lanes in the order the scheduler serves them
    pub const BY_PRIORITY: [WriteKind; 2] = [WriteKind::Metadata, WriteKind::Content];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WriteKind::Metadata => "metadata",
            WriteKind::Content => "content",
        }
    }
}

/// How a queued write ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Accepted by the backend
    Flushed,
    /// The batch carrying the write failed
    Failed(DhubError),
    /// Discarded by a non-draining stop
    Cancelled,
}

impl FlushOutcome {
    pub fn into_result(self, key: &str) -> crate::Result<()> {
        match self {
            FlushOutcome::Flushed => Ok(()),
            FlushOutcome::Failed(err) => Err(err),
            FlushOutcome::Cancelled => Err(DhubError::Cancelled(format!(
                "write for {} was discarded before flushing",
                key
            ))),
        }
    }
}

/// Generation of a registry entry, carried by every task that extends it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

type Signal = watch::Sender<Option<FlushOutcome>>;

/// Receiver half handed to a waiter
pub type Waiter = watch::Receiver<Option<FlushOutcome>>;

struct Entry {
    ticket: Ticket,
    outstanding: usize,
    /// First non-success outcome among the entry's tasks
    failure: Option<FlushOutcome>,
    /// Created lazily when the first waiter arrives
    signal: Option<Signal>,
}

#[derive(Default)]
struct State {
    entries: [HashMap<String, Entry>; 2],
    pending: usize,
    next_ticket: u64,
}

/// Registry of pending keys and their waiters
///
/// All entry mutations and the pending-task counter share one mutex. The
/// lock is never held while waiting for a signal.
#[derive(Default)]
pub struct CompletionRegistry {
    state: Mutex<State>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the maps half-updated,
        // so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one more queued write for `key`
    pub fn register(&self, kind: WriteKind, key: &str) -> Ticket {
        let mut state = self.lock();
        state.pending += 1;

        let fresh = Ticket(state.next_ticket);
        let entry = state.entries[kind.index()]
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                ticket: fresh,
                outstanding: 0,
                failure: None,
                signal: None,
            });
        entry.outstanding += 1;
        let ticket = entry.ticket;

        if ticket == fresh {
            state.next_ticket += 1;
        }
        ticket
    }

    /// Whether any of `keys` has a queued write under `kind`
    pub fn is_pending<K: AsRef<str>>(&self, kind: WriteKind, keys: &[K]) -> bool {
        let state = self.lock();
        let entries = &state.entries[kind.index()];
        keys.iter().any(|key| entries.contains_key(key.as_ref()))
    }

    /// Subscribe to the pending entries among `keys`
    ///
    /// Keys without an entry are skipped: there is nothing to wait for.
    pub fn subscribe<K: AsRef<str>>(&self, kind: WriteKind, keys: &[K]) -> Vec<(String, Waiter)> {
        let mut state = self.lock();
        let entries = &mut state.entries[kind.index()];

        keys.iter()
            .filter_map(|key| {
                let key = key.as_ref();
                let entry = entries.get_mut(key)?;
                let receiver = match &entry.signal {
                    Some(signal) => signal.subscribe(),
                    None => {
                        let (signal, receiver) = watch::channel(None);
                        entry.signal = Some(signal);
                        receiver
                    }
                };
                Some((key.to_string(), receiver))
            })
            .collect()
    }

    /// Complete a set of tasks of one namespace with a shared outcome
    ///
    /// Decrements the pending counter by `tasks.len()`. An entry fires once
    /// its last outstanding task completes; tasks whose ticket no longer
    /// matches (the entry was dropped and re-registered) only count toward
    /// the pending counter.
    pub fn complete<'a, I>(&self, kind: WriteKind, tasks: I, outcome: &FlushOutcome)
    where
        I: IntoIterator<Item = (&'a str, Ticket)>,
    {
        let mut state = self.lock();
        let mut completed = 0usize;
        let mut fired = 0usize;

        for (key, ticket) in tasks {
            completed += 1;

            let entries = &mut state.entries[kind.index()];
            let Some(entry) = entries.get_mut(key) else {
                continue;
            };
            if entry.ticket != ticket {
                continue;
            }

            if *outcome != FlushOutcome::Flushed && entry.failure.is_none() {
                entry.failure = Some(outcome.clone());
            }
            entry.outstanding = entry.outstanding.saturating_sub(1);
            if entry.outstanding > 0 {
                continue;
            }

            if let Some(entry) = entries.remove(key) {
                if let Some(signal) = entry.signal {
                    let result = entry.failure.unwrap_or(FlushOutcome::Flushed);
                    signal.send_replace(Some(result));
                    fired += 1;
                }
            }
        }

        state.pending = state.pending.saturating_sub(completed);
        debug!(kind = kind.as_str(), completed, fired, pending = state.pending, "Writes completed");
    }

    /// Drop the entries for `keys`, e.g. after a waiter gave up
    ///
    /// Queued tasks for those keys still count as pending; their later
    /// completion is ignored by the entry map.
    pub fn forget<K: AsRef<str>>(&self, kind: WriteKind, keys: &[K]) {
        let mut state = self.lock();
        let entries = &mut state.entries[kind.index()];
        for key in keys {
            entries.remove(key.as_ref());
        }
    }

    /// Number of queued writes not yet flushed or discarded
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// Number of keys with queued writes under `kind`
    pub fn pending_keys(&self, kind: WriteKind) -> usize {
        self.lock().entries[kind.index()].len()
    }
}

/// Wait for a subscribed entry to fire
pub async fn outcome_of(mut waiter: Waiter) -> FlushOutcome {
    loop {
        if let Some(outcome) = waiter.borrow_and_update().clone() {
            return outcome;
        }
        if waiter.changed().await.is_err() {
            // Entry dropped by another waiter's timeout cleanup.
            return waiter.borrow().clone().unwrap_or_else(|| {
                FlushOutcome::Failed(DhubError::Timeout(
                    "pending write is no longer tracked".into(),
                ))
            });
        }
    }
}
