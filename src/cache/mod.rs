//! Read-side caching
//!
//! - [`PageCache`]: ordinal index -> element id, per filter, with a TTL
//! - [`ContentPromise`]: shared, lazily awaited content bundle
//! - [`ConsistencyGate`]: holds reads back until queued writes for the same
//!   keys have flushed

mod gate;
mod page_cache;
mod promise;

pub use gate::ConsistencyGate;
pub use page_cache::{PageCache, PageKeys};
pub use promise::{ContentBundle, ContentPromise};
