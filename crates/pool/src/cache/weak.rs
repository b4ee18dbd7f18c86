//! Weak-referenced concurrent cache.
//!
//! Values are held as [`Weak`] pointers, so the cache never keeps anything
//! alive: once the last [`Arc`] held elsewhere is dropped the entry is dead.
//! Reads remove dead entries they come across. Mutators never hold a map lock
//! while user code runs; they read the current cell, compute outside the lock
//! and publish with a compare-and-set on the entry, retrying when another
//! writer got there first.

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Non-owning key/value cache.
pub struct WeakCache<K, V: ?Sized> {
    map: DashMap<K, Weak<V>>,
}

impl<K, V: ?Sized> fmt::Debug for WeakCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCache")
            .field("entries", &self.map.len())
            .finish()
    }
}

impl<K, V> Default for WeakCache<K, V>
where
    K: Eq + Hash + Clone,
    V: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

fn same_cell<V: ?Sized>(a: &Weak<V>, b: &Weak<V>) -> bool {
    Weak::ptr_eq(a, b)
}

impl<K, V> WeakCache<K, V>
where
    K: Eq + Hash + Clone,
    V: ?Sized,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Publish `new` for `key` if the current cell is still `expected`.
    ///
    /// `expected == None` means the key must be absent; `new == None` removes.
    fn compare_and_set(&self, key: &K, expected: Option<&Weak<V>>, new: Option<Weak<V>>) -> bool {
        match self.map.entry(key.clone()) {
            Entry::Occupied(mut entry) => match expected {
                Some(expected) if same_cell(entry.get(), expected) => {
                    match new {
                        Some(cell) => {
                            entry.insert(cell);
                        }
                        None => {
                            entry.remove();
                        }
                    }
                    true
                }
                _ => false,
            },
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return false;
                }
                if let Some(cell) = new {
                    entry.insert(cell);
                }
                true
            }
        }
    }

    fn current(&self, key: &K) -> Option<Weak<V>> {
        self.map.get(key).map(|cell| cell.value().clone())
    }

    fn drop_if_dead<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove_if(key, |_, cell| cell.strong_count() == 0);
    }

    /// Value for `key`, if it is still alive.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let cell = self.map.get(key).map(|cell| cell.value().clone())?;
        let value = cell.upgrade();
        if value.is_none() {
            self.drop_if_dead(key);
        }
        value
    }

    /// Whether a live value is stored for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Whether `value` (by identity) is stored under any key.
    pub fn contains_value(&self, value: &Arc<V>) -> bool {
        self.purge();
        self.map
            .iter()
            .any(|cell| std::ptr::addr_eq(cell.value().as_ptr(), Arc::as_ptr(value)))
    }

    /// Store `value`, returning the previous live value.
    pub fn put(&self, key: K, value: &Arc<V>) -> Option<Arc<V>> {
        self.map
            .insert(key, Arc::downgrade(value))
            .and_then(|old| old.upgrade())
    }

    /// Store `value` unless a live value is present; returns the live value if so.
    pub fn put_if_absent(&self, key: K, value: &Arc<V>) -> Option<Arc<V>> {
        loop {
            let current = self.current(&key);
            if let Some(live) = current.as_ref().and_then(Weak::upgrade) {
                return Some(live);
            }
            if self.compare_and_set(&key, current.as_ref(), Some(Arc::downgrade(value))) {
                return None;
            }
        }
    }

    /// Recompute the value for `key`.
    ///
    /// `f` may run more than once under contention. Returning `None` removes
    /// the entry.
    pub fn compute<F>(&self, key: K, mut f: F) -> Option<Arc<V>>
    where
        F: FnMut(&K, Option<Arc<V>>) -> Option<Arc<V>>,
    {
        loop {
            let current = self.current(&key);
            let next = f(&key, current.as_ref().and_then(Weak::upgrade));
            if self.compare_and_set(&key, current.as_ref(), next.as_ref().map(Arc::downgrade)) {
                return next;
            }
        }
    }

    /// Return the live value for `key`, or compute and store one.
    pub fn compute_if_absent<F>(&self, key: K, mut f: F) -> Option<Arc<V>>
    where
        F: FnMut(&K) -> Option<Arc<V>>,
    {
        loop {
            let current = self.current(&key);
            if let Some(live) = current.as_ref().and_then(Weak::upgrade) {
                return Some(live);
            }
            let next = f(&key);
            if next.is_none() {
                self.drop_if_dead(&key);
                return None;
            }
            if self.compare_and_set(&key, current.as_ref(), next.as_ref().map(Arc::downgrade)) {
                return next;
            }
        }
    }

    /// Recompute the value for `key` only while a live value is present.
    pub fn compute_if_present<F>(&self, key: K, mut f: F) -> Option<Arc<V>>
    where
        F: FnMut(&K, Arc<V>) -> Option<Arc<V>>,
    {
        loop {
            let current = self.current(&key)?;
            let Some(live) = current.upgrade() else {
                self.drop_if_dead(&key);
                return None;
            };
            let next = f(&key, live);
            if self.compare_and_set(&key, Some(&current), next.as_ref().map(Arc::downgrade)) {
                return next;
            }
        }
    }

    /// Store `value`, or combine it with the live value through `f`.
    pub fn merge<F>(&self, key: K, value: &Arc<V>, mut f: F) -> Option<Arc<V>>
    where
        F: FnMut(Arc<V>, Arc<V>) -> Option<Arc<V>>,
    {
        self.compute(key, |_, current| match current {
            Some(existing) => f(existing, Arc::clone(value)),
            None => Some(Arc::clone(value)),
        })
    }

    /// Replace the live value for `key`, returning it.
    pub fn replace(&self, key: K, value: &Arc<V>) -> Option<Arc<V>> {
        loop {
            let current = self.current(&key)?;
            let live = current.upgrade()?;
            if self.compare_and_set(&key, Some(&current), Some(Arc::downgrade(value))) {
                return Some(live);
            }
        }
    }

    /// Replace the value for `key` only if it is `expected` (by identity).
    pub fn replace_if(&self, key: K, expected: &Arc<V>, value: &Arc<V>) -> bool {
        loop {
            let Some(current) = self.current(&key) else {
                return false;
            };
            if !std::ptr::addr_eq(current.as_ptr(), Arc::as_ptr(expected)) {
                return false;
            }
            if self.compare_and_set(&key, Some(&current), Some(Arc::downgrade(value))) {
                return true;
            }
        }
    }

    /// Remove `key`, returning its live value.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.remove(key).and_then(|(_, cell)| cell.upgrade())
    }

    /// Remove `key` only if it maps to `value` (by identity).
    pub fn remove_if<Q>(&self, key: &Q, value: &Arc<V>) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map
            .remove_if(key, |_, cell| {
                std::ptr::addr_eq(cell.as_ptr(), Arc::as_ptr(value))
            })
            .is_some()
    }

    /// Snapshot of live entries.
    pub fn entries(&self) -> Vec<(K, Arc<V>)> {
        self.purge();
        self.map
            .iter()
            .filter_map(|cell| cell.value().upgrade().map(|v| (cell.key().clone(), v)))
            .collect()
    }

    /// Visit every live entry.
    pub fn for_each(&self, mut f: impl FnMut(&K, &Arc<V>)) {
        for (key, value) in self.entries() {
            f(&key, &value);
        }
    }

    /// Snapshot of live values.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    /// Snapshot of keys with live values.
    pub fn keys(&self) -> Vec<K> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    /// Number of stored cells, including dead ones not yet purged.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no cells are stored.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.map.clear();
    }

    /// Remove every dead entry now. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let before = self.map.len();
        self.map.retain(|_, cell| cell.strong_count() > 0);
        before.saturating_sub(self.map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn compute_if_absent_declining_drops_dead_entry() {
        let cache: WeakCache<String, str> = WeakCache::new();
        let value: Arc<str> = Arc::from("mock:a");
        cache.put("a".to_string(), &value);
        drop(value);
        assert_eq!(cache.len(), 1);

        assert!(cache.compute_if_absent("a".to_string(), |_| None).is_none());
        assert_eq!(cache.len(), 0);
        assert!(!cache.contains_key("a"));
    }

    #[test]
    fn dead_entries_are_dropped_on_read() {
        let cache: WeakCache<String, str> = WeakCache::new();
        let value: Arc<str> = Arc::from("mock:a");
        cache.put("a".to_string(), &value);
        assert_eq!(cache.get("a").as_deref(), Some("mock:a"));

        drop(value);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 0);
        assert!(!cache.contains_key("a"));
    }

    #[test]
    fn put_if_absent_replaces_dead_cell() {
        let cache = WeakCache::new();
        let first = Arc::new(1);
        assert!(cache.put_if_absent("k", &first).is_none());
        let second = Arc::new(2);
        assert_eq!(cache.put_if_absent("k", &second).as_deref(), Some(&1));

        drop(first);
        assert!(cache.put_if_absent("k", &second).is_none());
        assert_eq!(cache.get("k").as_deref(), Some(&2));
    }

    #[test]
    fn compute_family() {
        let cache = WeakCache::new();
        let keep = Arc::new(10);
        let out = cache.compute("k", |_, current| {
            assert!(current.is_none());
            Some(Arc::clone(&keep))
        });
        assert!(Arc::ptr_eq(out.as_ref().unwrap(), &keep));

        let calls = AtomicUsize::new(0);
        let existing = cache.compute_if_absent("k", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert_eq!(existing.as_deref(), Some(&10));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(cache.compute_if_present("missing", |_, v| Some(v)).is_none());
        assert!(cache.compute_if_present("k", |_, _| None).is_none());
        assert!(!cache.contains_key("k"));
    }

    #[test]
    fn merge_and_replace_by_identity() {
        let cache = WeakCache::new();
        let a = Arc::new(1);
        let b = Arc::new(2);
        let sum = Arc::new(3);
        cache.merge("k", &a, |_, _| unreachable!());
        let merged = cache.merge("k", &b, |_, _| Some(Arc::clone(&sum)));
        assert!(Arc::ptr_eq(merged.as_ref().unwrap(), &sum));

        assert!(!cache.replace_if("k", &a, &b));
        assert!(cache.replace_if("k", &sum, &a));
        assert_eq!(cache.replace("k", &b).as_deref(), Some(&1));
        assert!(cache.contains_value(&b));
        assert!(!cache.remove_if("k", &a));
        assert!(cache.remove_if("k", &b));
        assert!(cache.is_empty());
    }

    #[test]
    fn traversal_skips_and_purges_dead_values() {
        let cache = WeakCache::new();
        let live = Arc::new("live");
        let dead = Arc::new("dead");
        cache.put(1, &live);
        cache.put(2, &dead);
        drop(dead);

        let mut seen = Vec::new();
        cache.for_each(|k, v| seen.push((*k, **v)));
        assert_eq!(seen, vec![(1, "live")]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.keys(), vec![1]);
    }

    #[test]
    fn purge_reports_removed_count() {
        let cache = WeakCache::new();
        let values: Vec<_> = (0..4).map(Arc::new).collect();
        for (i, v) in values.iter().enumerate() {
            cache.put(i, v);
        }
        drop(values);
        assert_eq!(cache.purge(), 4);
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_put_if_absent_agrees_on_one_value() {
        let cache = Arc::new(WeakCache::<&str, usize>::new());
        let values: Vec<_> = (0..8).map(Arc::new).collect();
        let winners: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = values
                .iter()
                .map(|v| {
                    let cache = Arc::clone(&cache);
                    s.spawn(move || cache.put_if_absent("k", v).unwrap_or_else(|| Arc::clone(v)))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let first = &winners[0];
        assert!(winners.iter().all(|w| Arc::ptr_eq(w, first)));
    }
}
