//! Associative caches used by the pools.
//!
//! - [`LruCache`] bounds the number of entries and evicts the least recently
//!   used ones, reporting each eviction to a listener.
//! - [`WeakCache`] holds values without owning them; entries disappear once
//!   the last strong reference elsewhere is dropped.

pub mod lru;
pub mod weak;

pub use lru::{CacheStats, LruCache};
pub use weak::WeakCache;
