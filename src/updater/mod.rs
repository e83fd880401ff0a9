//! Deferred element writes
//!
//! The [`WriteCoalescer`] queues metadata and content writes and flushes
//! them in bundles; the [`CompletionRegistry`] lets readers wait for the
//! writes touching the keys they are about to read.

mod coalescer;
mod registry;

pub use coalescer::{CoalescerConfig, CoalescerStats, WriteCoalescer, WritePayload, WriteTask};
pub use registry::{CompletionRegistry, FlushOutcome, Ticket, WriteKind};
