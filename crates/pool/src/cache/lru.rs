//! Recency-bounded concurrent cache.
//!
//! Reads and writes go straight to a sharded concurrent map. Every write that
//! leaves a value behind, and every successful read, appends a `(key, stamp)`
//! record to an unbounded change log and re-stamps the entry. Once the map
//! holds more than `capacity` entries, or the log holds more than
//! `2 * capacity` records, the writing thread tries to become the evictor by
//! flipping a single atomic flag. The evictor pops records oldest-first and
//! removes an entry only when its current stamp still matches the record, so
//! stale records for entries touched again later are skipped. A log that is
//! still too long afterwards is compacted down to the live records. Threads
//! that lose the flag race return immediately; their records stay in the log
//! and are handled by the next evictor.

use std::borrow::Borrow;
use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use crate::error::{Error, Result};

type EvictionListener<K, V> = Box<dyn Fn(K, V) + Send + Sync>;

struct Slot<V> {
    value: V,
    stamp: AtomicU64,
}

impl<V> Slot<V> {
    fn new(value: V, stamp: u64) -> Self {
        Self {
            value,
            stamp: AtomicU64::new(stamp),
        }
    }

    fn stamp(&self) -> u64 {
        self.stamp.load(Ordering::Acquire)
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Successful lookups.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries removed to honour the capacity bound.
    pub evictions: u64,
    /// Change records appended since creation or the last reset.
    pub total_changes: u64,
}

/// A bounded key/value cache that evicts least recently used entries.
pub struct LruCache<K, V> {
    map: DashMap<K, Slot<V>>,
    changes: Mutex<VecDeque<(K, u64)>>,
    capacity: usize,
    clock: AtomicU64,
    evicting: AtomicBool,
    on_evict: Option<EvictionListener<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    total_changes: AtomicU64,
}

impl<K, V> fmt::Debug for LruCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("size", &self.map.len())
            .field("pending_changes", &self.changes.lock().len())
            .finish()
    }
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Create a cache bounded to `capacity` entries.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::invalid_argument("cache capacity must be greater than 0"));
        }
        Ok(Self {
            map: DashMap::new(),
            changes: Mutex::new(VecDeque::new()),
            capacity,
            clock: AtomicU64::new(0),
            evicting: AtomicBool::new(false),
            on_evict: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            total_changes: AtomicU64::new(0),
        })
    }

    /// Register a listener invoked for every evicted entry.
    ///
    /// The listener runs on whichever writer thread performs the eviction,
    /// outside of any map lock, and never concurrently with itself.
    #[must_use]
    pub fn with_eviction_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        self.on_evict = Some(Box::new(listener));
        self
    }

    /// Maximum number of entries kept once eviction settles.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up `key`, marking the entry as most recently used.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let found = self.map.get(key).map(|slot| {
            let stamp = self.next_stamp();
            slot.stamp.store(stamp, Ordering::Release);
            (slot.key().clone(), slot.value.clone(), stamp)
        });
        match found {
            Some((key, value, stamp)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.record(key, stamp);
                self.evict_if_needed();
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Look up `key` without touching recency or statistics.
    pub fn peek<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key).map(|slot| slot.value.clone())
    }

    /// Whether `key` is present. Does not touch recency.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Insert or replace, returning the previous value.
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let stamp = self.next_stamp();
        let previous = self
            .map
            .insert(key.clone(), Slot::new(value, stamp))
            .map(|slot| slot.value);
        self.record(key, stamp);
        self.evict_if_needed();
        previous
    }

    /// Insert only if absent. Returns the existing value when there is one.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        let stamp = self.next_stamp();
        let existing = match self.map.entry(key.clone()) {
            Entry::Occupied(entry) => Some(entry.get().value.clone()),
            Entry::Vacant(entry) => {
                entry.insert(Slot::new(value, stamp));
                None
            }
        };
        if existing.is_none() {
            self.record(key, stamp);
            self.evict_if_needed();
        }
        existing
    }

    /// Return the value for `key`, computing and inserting it if absent.
    pub fn compute_if_absent(&self, key: K, f: impl FnOnce(&K) -> V) -> V {
        let stamp = self.next_stamp();
        let (value, inserted) = match self.map.entry(key.clone()) {
            Entry::Occupied(entry) => (entry.get().value.clone(), false),
            Entry::Vacant(entry) => {
                let value = f(entry.key());
                entry.insert(Slot::new(value.clone(), stamp));
                (value, true)
            }
        };
        if inserted {
            self.record(key, stamp);
            self.evict_if_needed();
        }
        value
    }

    /// Recompute the value for `key`.
    ///
    /// `f` receives the current value (if any); returning `None` removes the
    /// entry. Returns the new value.
    pub fn compute(&self, key: K, f: impl FnOnce(&K, Option<&V>) -> Option<V>) -> Option<V> {
        let stamp = self.next_stamp();
        let result = match self.map.entry(key.clone()) {
            Entry::Occupied(mut entry) => match f(entry.key(), Some(&entry.get().value)) {
                Some(value) => {
                    entry.insert(Slot::new(value.clone(), stamp));
                    Some(value)
                }
                None => {
                    entry.remove();
                    None
                }
            },
            Entry::Vacant(entry) => match f(entry.key(), None) {
                Some(value) => {
                    entry.insert(Slot::new(value.clone(), stamp));
                    Some(value)
                }
                None => None,
            },
        };
        if result.is_some() {
            self.record(key, stamp);
            self.evict_if_needed();
        }
        result
    }

    /// Recompute the value for `key` only if present.
    pub fn compute_if_present(&self, key: K, f: impl FnOnce(&K, &V) -> Option<V>) -> Option<V> {
        self.compute(key, |k, current| current.and_then(|v| f(k, v)))
    }

    /// Insert `value`, or combine it with the existing value through `f`.
    ///
    /// `f` returning `None` removes the entry.
    pub fn merge(&self, key: K, value: V, f: impl FnOnce(&V, V) -> Option<V>) -> Option<V> {
        self.compute(key, move |_, current| match current {
            Some(existing) => f(existing, value),
            None => Some(value),
        })
    }

    /// Replace the value for `key` only if present, returning the old value.
    pub fn replace(&self, key: K, value: V) -> Option<V> {
        let stamp = self.next_stamp();
        let previous = match self.map.get_mut(&key) {
            Some(mut slot) => Some(std::mem::replace(&mut *slot, Slot::new(value, stamp)).value),
            None => None,
        };
        if previous.is_some() {
            self.record(key, stamp);
            self.evict_if_needed();
        }
        previous
    }

    /// Remove `key`, returning its value. No eviction listener is invoked.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key).map(|(_, slot)| slot.value)
    }

    /// Snapshot of all values.
    pub fn values(&self) -> Vec<V> {
        self.map.iter().map(|slot| slot.value.clone()).collect()
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<K> {
        self.map.iter().map(|slot| slot.key().clone()).collect()
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .map(|slot| (slot.key().clone(), slot.value.clone()))
            .collect()
    }

    /// Remove every entry and drop the change log. No listener is invoked.
    pub fn clear(&self) {
        self.map.clear();
        self.changes.lock().clear();
    }

    /// Run a pending eviction sweep now.
    pub fn clean_up(&self) {
        self.evict_if_needed();
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_changes: self.total_changes.load(Ordering::Relaxed),
        }
    }

    /// Reset the counters to zero.
    pub fn reset_statistics(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.total_changes.store(0, Ordering::Relaxed);
    }

    fn next_stamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record(&self, key: K, stamp: u64) {
        self.changes.lock().push_back((key, stamp));
        self.total_changes.fetch_add(1, Ordering::Relaxed);
    }

    fn over_bounds(&self) -> bool {
        self.map.len() > self.capacity || self.changes.lock().len() > self.capacity * 2
    }

    fn evict_if_needed(&self) {
        // The flag holder re-checks the bounds after releasing the flag, so
        // records pushed during its sweep are not stranded.
        while self.over_bounds() {
            if self
                .evicting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.sweep();
            self.evicting.store(false, Ordering::Release);
        }
    }

    fn sweep(&self) {
        while self.map.len() > self.capacity {
            let Some((key, stamp)) = self.changes.lock().pop_front() else {
                break;
            };
            let evicted = self.map.remove_if(&key, |_, slot| slot.stamp() == stamp);
            if let Some((key, slot)) = evicted {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                if let Some(listener) = &self.on_evict {
                    listener(key, slot.value);
                }
            }
        }
        let mut changes = self.changes.lock();
        if changes.len() > self.capacity * 2 {
            changes.retain(|(key, stamp)| {
                self.map
                    .get(key)
                    .is_some_and(|slot| slot.stamp() == *stamp)
            });
        }
    }
}
