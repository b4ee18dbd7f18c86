//! Per-endpoint usage counters for producer and consumer caches.

use std::collections::BTreeMap;

use crate::cache::LruCache;
use crate::error::Result;

/// Counts how often each endpoint URI was used.
///
/// Bounded by a recency cache so that rarely used endpoints drop out.
#[derive(Debug)]
pub struct EndpointUtilizationStatistics {
    hits: LruCache<String, u64>,
}

impl EndpointUtilizationStatistics {
    /// Track at most `capacity` endpoints.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidArgument`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            hits: LruCache::new(capacity)?,
        })
    }

    /// Record one use of `uri`.
    pub fn on_hit(&self, uri: &str) {
        self.hits
            .compute(uri.to_string(), |_, count| Some(count.map_or(1, |c| c + 1)));
    }

    /// Uses recorded for `uri`.
    pub fn hits(&self, uri: &str) -> u64 {
        self.hits.peek(uri).unwrap_or(0)
    }

    /// Number of endpoints tracked.
    pub fn size(&self) -> usize {
        self.hits.len()
    }

    /// Maximum number of endpoints tracked.
    pub fn capacity(&self) -> usize {
        self.hits.capacity()
    }

    /// Forget every endpoint.
    pub fn clear(&self) {
        self.hits.clear();
    }

    /// Sorted snapshot of all counters.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.hits.entries().into_iter().collect()
    }
}
