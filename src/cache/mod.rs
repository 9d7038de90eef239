//! In-memory caches for the read path.
//!
//! - [`CacheKey`] canonicalizes free-text query terms
//! - [`CoalescingCache`] is a weighted LRU that runs at most one fetch per key
//! - [`TtlCache`] holds small derived values for a fixed lifetime

mod coalescing;
mod key;
mod result;
mod ttl;

pub use coalescing::{CoalescingCache, Weighted};
pub use key::{fold_term, CacheKey};
pub use result::{CacheResult, CacheSource};
pub use ttl::TtlCache;
