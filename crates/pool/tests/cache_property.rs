//! Property tests for the recency-bounded and weak-referenced caches.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use nebula_pool::cache::{LruCache, WeakCache};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Reference model: least recently written keys go first
// ---------------------------------------------------------------------------

/// Keys left after writing `keys` in order, plus how many evictions it took.
fn model_survivors(capacity: usize, keys: &[u8]) -> (Vec<u8>, usize) {
    let mut order: VecDeque<u8> = VecDeque::new();
    let mut evictions = 0;
    for key in keys {
        order.retain(|k| k != key);
        order.push_back(*key);
        while order.len() > capacity {
            order.pop_front();
            evictions += 1;
        }
    }
    let mut survivors: Vec<u8> = order.into_iter().collect();
    survivors.sort_unstable();
    (survivors, evictions)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn size_never_exceeds_capacity(capacity in 1usize..16, keys in prop::collection::vec(0u32..256, 0..200)) {
        let cache = LruCache::new(capacity).unwrap();
        for key in keys {
            cache.put(key, key);
            prop_assert!(cache.len() <= capacity);
        }
    }

    #[test]
    fn evicts_exactly_the_least_recently_written(capacity in 1usize..8, keys in prop::collection::vec(0u8..24, 1..120)) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache = LruCache::new(capacity)
            .unwrap()
            .with_eviction_listener(move |k: u8, _v: u8| sink.lock().unwrap().push(k));
        for key in &keys {
            cache.put(*key, *key);
        }

        let (expected, evictions) = model_survivors(capacity, &keys);
        let mut survivors = cache.keys();
        survivors.sort_unstable();
        prop_assert_eq!(survivors, expected);
        // a key evicted and written again is evicted again
        prop_assert_eq!(evicted.lock().unwrap().len(), evictions);
    }

    #[test]
    fn rewritten_key_is_evicted_each_time(capacity in 1usize..4, rounds in 1usize..6) {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let cache = LruCache::new(capacity)
            .unwrap()
            .with_eviction_listener(move |k: u8, _v: u8| sink.lock().unwrap().push(k));
        let mut keys = Vec::new();
        for _ in 0..rounds {
            keys.push(200u8);
            keys.extend((0..u8::try_from(capacity).unwrap()).map(|k| k + 1));
        }
        for key in &keys {
            cache.put(*key, *key);
        }
        let hot = evicted.lock().unwrap().iter().filter(|k| **k == 200).count();
        prop_assert_eq!(hot, rounds);
        prop_assert_eq!(evicted.lock().unwrap().len(), model_survivors(capacity, &keys).1);
    }

    #[test]
    fn weak_cache_only_reports_live_values(live in prop::collection::vec(any::<bool>(), 1..40)) {
        let cache = WeakCache::new();
        let mut keep = Vec::new();
        for (i, alive) in live.iter().enumerate() {
            let value = Arc::new(i);
            cache.put(i, &value);
            if *alive {
                keep.push(value);
            }
        }
        for (i, alive) in live.iter().enumerate() {
            prop_assert_eq!(cache.contains_key(&i), *alive);
        }
        prop_assert_eq!(cache.len(), keep.len());
        prop_assert_eq!(cache.values().len(), keep.len());
    }
}
