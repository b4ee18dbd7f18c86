//! Resource pool coordinator.
//!
//! [`ServicePool`] keeps one pool per endpoint URI: a [`SinglePool`] for
//! endpoints whose resources may be shared, a [`MultiPool`] otherwise. Every
//! acquired resource is also recorded in a recency-bounded cache; when that
//! cache evicts, the owning pool is marked and the resource is stopped the next
//! time the pool is touched. If the number of endpoint pools exceeds the
//! capacity the whole pool is stopped on the spot.

mod multi;
mod single;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::LruCache;
use crate::config::PoolConfig;
use crate::endpoint::{Endpoint, Pooled};
use crate::error::Result;
use crate::lifecycle::{Service, ServiceStatus, ServiceSupport, service_key, stop_and_deregister};

pub(crate) use multi::MultiPool;
pub(crate) use single::SinglePool;

// ---------------------------------------------------------------------------
// Per-endpoint pools
// ---------------------------------------------------------------------------

/// Outcome of asking a per-endpoint pool for a resource.
pub(crate) enum Acquired<S: ?Sized> {
    Resource(Arc<S>),
    /// The pool was stopped while the caller held a reference to it.
    Retired,
}

pub(crate) enum PoolEntry<S: ?Sized> {
    Single(Arc<SinglePool<S>>),
    Multi(Arc<MultiPool<S>>),
}

impl<S: ?Sized> Clone for PoolEntry<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Single(p) => Self::Single(Arc::clone(p)),
            Self::Multi(p) => Self::Multi(Arc::clone(p)),
        }
    }
}

impl<S: ?Sized + Pooled> PoolEntry<S> {
    fn id(&self) -> u64 {
        match self {
            Self::Single(p) => p.id(),
            Self::Multi(p) => p.id(),
        }
    }

    fn acquire(&self, shared: &Shared<S>) -> Result<Acquired<S>> {
        match self {
            Self::Single(p) => p.acquire(shared),
            Self::Multi(p) => p.acquire(shared),
        }
    }

    fn release(&self, shared: &Shared<S>, resource: Arc<S>) {
        match self {
            Self::Single(p) => p.release(shared, resource),
            Self::Multi(p) => p.release(shared, resource),
        }
    }

    fn evict(&self, shared: &Shared<S>, resource: Arc<S>) {
        match self {
            Self::Single(p) => p.evict(shared, resource),
            Self::Multi(p) => p.evict(resource),
        }
    }

    fn clean_up(&self, shared: &Shared<S>) {
        match self {
            Self::Single(p) => p.clean_up(shared),
            Self::Multi(p) => p.clean_up(),
        }
    }

    fn stop(&self, shared: &Shared<S>) {
        match self {
            Self::Single(p) => p.stop(shared),
            Self::Multi(p) => p.stop(shared),
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Single(p) => p.size(),
            Self::Multi(p) => p.size(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State reachable from both the coordinator and the cache eviction listener.
pub(crate) struct Shared<S: ?Sized> {
    pools: DashMap<String, PoolEntry<S>>,
    /// Single pools marked for eviction, by endpoint URI and pool id.
    single_evicted: DashMap<String, u64>,
    capacity: usize,
    config: PoolConfig,
    next_id: AtomicU64,
}

impl<S: ?Sized + Pooled> Shared<S> {
    fn pool_for(&self, endpoint: &Arc<dyn Endpoint>) -> PoolEntry<S> {
        self.pools
            .entry(endpoint.uri().to_string())
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                if endpoint.is_singleton_producer() {
                    trace!(endpoint = %endpoint.uri(), kind = S::KIND, "Creating single pool");
                    PoolEntry::Single(Arc::new(SinglePool::new(id, Arc::clone(endpoint))))
                } else {
                    trace!(endpoint = %endpoint.uri(), kind = S::KIND, "Creating multi pool");
                    PoolEntry::Multi(Arc::new(MultiPool::new(
                        id,
                        Arc::clone(endpoint),
                        self.capacity,
                    )))
                }
            })
            .clone()
    }

    fn lookup(&self, uri: &str) -> Option<PoolEntry<S>> {
        self.pools.get(uri).map(|entry| entry.value().clone())
    }

    fn snapshot(&self) -> Vec<PoolEntry<S>> {
        self.pools.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Remove the pool registered under `uri` if it is still pool `id`.
    pub(crate) fn remove_pool(&self, uri: &str, id: u64) {
        self.pools.remove_if(uri, |_, pool| pool.id() == id);
    }

    pub(crate) fn mark_single_evicted(&self, uri: &str, id: u64) {
        self.single_evicted.insert(uri.to_string(), id);
    }

    /// Clear the eviction mark for pool `id`, returning whether it was set.
    pub(crate) fn take_single_evicted(&self, uri: &str, id: u64) -> bool {
        self.single_evicted
            .remove_if(uri, |_, marked| *marked == id)
            .is_some()
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Eviction listener of the recency cache.
    fn on_evict(&self, resource: Arc<S>) {
        let endpoint = resource.owning_endpoint();
        match self.lookup(endpoint.uri()) {
            Some(pool) => {
                trace!(endpoint = %endpoint.uri(), kind = S::KIND, "Evicting");
                pool.evict(self, resource);
                if self.pools.len() > self.capacity {
                    debug!(
                        endpoint = %endpoint.uri(),
                        capacity = self.capacity,
                        "Pool count exceeds capacity, stopping pool"
                    );
                    pool.stop(self);
                }
            }
            None => {
                trace!(endpoint = %endpoint.uri(), kind = S::KIND, "Stopping orphaned resource");
                stop_and_deregister(resource.into_service(), &*endpoint.authority());
            }
        }
    }
}

/// Create a resource, register it with its endpoint's authority and wait for
/// it to leave the starting state.
pub(crate) fn create_resource<S: ?Sized + Pooled>(
    endpoint: &Arc<dyn Endpoint>,
    config: &PoolConfig,
    enlist: bool,
) -> Result<Arc<S>> {
    let resource = S::create(Arc::clone(endpoint))?;
    endpoint
        .authority()
        .add_service(Arc::clone(&resource).into_service(), true, enlist)?;
    wait_for_start(&*resource, config, endpoint.uri());
    trace!(endpoint = %endpoint.uri(), kind = S::KIND, "Created");
    Ok(resource)
}

fn wait_for_start<S: ?Sized + Service>(resource: &S, config: &PoolConfig, uri: &str) {
    if !resource.is_starting() {
        return;
    }
    let started = Instant::now();
    while resource.is_starting() {
        if started.elapsed() >= config.start_timeout {
            warn!(
                endpoint = %uri,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Resource did not finish starting in time, using it anyway"
            );
            return;
        }
        thread::sleep(config.start_poll_interval);
    }
    debug!(
        endpoint = %uri,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Resource finished starting"
    );
}

// ---------------------------------------------------------------------------
// ServicePool
// ---------------------------------------------------------------------------

/// Coordinates per-endpoint pools of producers or polling consumers.
///
/// `capacity` bounds the recency cache (total tracked resources), the number
/// of endpoint pools kept alive under eviction pressure, and the idle queue
/// of each multi pool. A capacity of zero disables the recency cache.
pub struct ServicePool<S: ?Sized + Pooled> {
    shared: Arc<Shared<S>>,
    cache: Option<LruCache<usize, Arc<S>>>,
    cache_lock: Mutex<()>,
    status: ServiceSupport,
}

impl<S: ?Sized + Pooled> std::fmt::Debug for ServicePool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePool")
            .field("kind", &S::KIND)
            .field("capacity", &self.shared.capacity)
            .field("pools", &self.shared.pools.len())
            .field("status", &self.status.status())
            .finish()
    }
}

impl<S> ServicePool<S>
where
    S: ?Sized + Pooled + 'static,
{
    /// Create a coordinator. It must be started before it hands out resources.
    pub fn new(capacity: usize, config: PoolConfig) -> Self {
        let shared = Arc::new(Shared {
            pools: DashMap::new(),
            single_evicted: DashMap::new(),
            capacity,
            config,
            next_id: AtomicU64::new(0),
        });
        let cache = LruCache::new(capacity).ok().map(|cache| {
            let listener = Arc::clone(&shared);
            cache.with_eviction_listener(move |_, resource: Arc<S>| listener.on_evict(resource))
        });
        Self {
            shared,
            cache,
            cache_lock: Mutex::new(()),
            status: ServiceSupport::new(),
        }
    }

    /// Acquire a resource for `endpoint`.
    ///
    /// Returns `Ok(None)` when the coordinator is not started.
    ///
    /// # Errors
    /// Propagates creation and start failures from the endpoint.
    pub fn acquire(&self, endpoint: &Arc<dyn Endpoint>) -> Result<Option<Arc<S>>> {
        loop {
            if self.status.status() != ServiceStatus::Started {
                return Ok(None);
            }
            let pool = self.shared.pool_for(endpoint);
            match pool.acquire(&self.shared)? {
                Acquired::Retired => {
                    self.shared.remove_pool(endpoint.uri(), pool.id());
                }
                Acquired::Resource(resource) => {
                    if let Some(cache) = &self.cache {
                        let _guard = self.cache_lock.lock();
                        cache.put_if_absent(service_key(&resource), Arc::clone(&resource));
                    }
                    return Ok(Some(resource));
                }
            }
        }
    }

    /// Hand `resource` back to the pool of `endpoint`.
    ///
    /// Does nothing if no pool is registered for the endpoint.
    pub fn release(&self, endpoint: &Arc<dyn Endpoint>, resource: Arc<S>) {
        if let Some(pool) = self.shared.lookup(endpoint.uri()) {
            pool.release(&self.shared, resource);
        }
    }

    /// Run the recency cache sweep and drain pending evictions in every pool.
    pub fn clean_up(&self) {
        if let Some(cache) = &self.cache {
            cache.clean_up();
        }
        for pool in self.shared.snapshot() {
            pool.clean_up(&self.shared);
        }
    }

    /// Resources held by all pools: one per live single pool plus every idle
    /// resource of every multi pool.
    pub fn size(&self) -> usize {
        self.shared.snapshot().iter().map(PoolEntry::size).sum()
    }

    /// Number of endpoint pools.
    pub fn pool_count(&self) -> usize {
        self.shared.pools.len()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Recency cache counters, if the cache is enabled.
    pub fn cache_stats(&self) -> Option<crate::cache::CacheStats> {
        self.cache.as_ref().map(LruCache::stats)
    }

    fn shutdown(&self) {
        self.clean_up();
        for pool in self.shared.snapshot() {
            pool.stop(&self.shared);
        }
        self.shared.pools.clear();
        if let Some(cache) = &self.cache {
            let _guard = self.cache_lock.lock();
            for resource in cache.values() {
                let authority = resource.owning_endpoint().authority();
                stop_and_deregister(resource.into_service(), &*authority);
            }
            cache.clear();
        }
        self.shared.single_evicted.clear();
    }
}

impl<S> Service for ServicePool<S>
where
    S: ?Sized + Pooled + 'static,
{
    fn start(&self) -> Result<()> {
        self.shared.config.validate()?;
        self.status.start_with(|| Ok(())).map(|_| ())
    }

    /// Stops every pool and every cached resource. Safe to call repeatedly.
    fn stop(&self) -> Result<()> {
        self.status
            .stop_with(|| {
                self.shutdown();
                debug!(kind = S::KIND, "Service pool stopped");
                Ok(())
            })
            .map(|_| ())
    }

    fn status(&self) -> ServiceStatus {
        self.status.status()
    }

    fn name(&self) -> String {
        format!("ServicePool<{}>", S::KIND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::endpoint::Producer;
    use crate::testing::{MockEndpoint, StopCounter};

    fn started_pool(capacity: usize) -> ServicePool<dyn Producer> {
        let pool = ServicePool::new(capacity, PoolConfig::default());
        pool.start().unwrap();
        pool
    }

    #[test]
    fn acquire_before_start_returns_none() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:a", &ctx).build();
        let pool: ServicePool<dyn Producer> = ServicePool::new(5, PoolConfig::default());
        assert!(pool.acquire(&endpoint.as_endpoint()).unwrap().is_none());
        assert_eq!(endpoint.created(), 0);
    }

    #[test]
    fn singleton_resource_is_reused() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:a", &ctx).build();
        let pool = started_pool(5);
        let handle = endpoint.as_endpoint();

        let first = pool.acquire(&handle).unwrap().unwrap();
        let second = pool.acquire(&handle).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(endpoint.created(), 1);
        assert_eq!(pool.size(), 1);
        assert!(first.is_started());
    }

    #[test]
    fn non_singleton_endpoints_get_distinct_resources() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:multi", &ctx).singleton(false).build();
        let pool = started_pool(5);
        let handle = endpoint.as_endpoint();

        let a = pool.acquire(&handle).unwrap().unwrap();
        let b = pool.acquire(&handle).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.size(), 0);
        pool.release(&handle, a);
        pool.release(&handle, b);
        assert_eq!(pool.size(), 2);

        pool.acquire(&handle).unwrap().unwrap();
        assert_eq!(endpoint.created(), 2);
    }

    #[test]
    fn creation_failure_propagates() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:broken", &ctx).failing_create().build();
        let pool = started_pool(5);
        assert!(pool.acquire(&endpoint.as_endpoint()).is_err());
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn eviction_stops_oldest_pools() {
        let ctx = Context::started("ctx");
        let stops = StopCounter::default();
        let pool = started_pool(2);
        let endpoints: Vec<_> = (0..4)
            .map(|i| {
                MockEndpoint::builder(format!("mock:e{i}"), &ctx)
                    .stop_counter(stops.clone())
                    .build()
            })
            .collect();

        for endpoint in &endpoints {
            let handle = endpoint.as_endpoint();
            let producer = pool.acquire(&handle).unwrap().unwrap();
            pool.release(&handle, producer);
        }
        assert_eq!(stops.get(), 2);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.pool_count(), 2);

        pool.stop().unwrap();
        assert_eq!(stops.get(), 4);
        assert_eq!(pool.size(), 0);
        assert_eq!(ctx.service_count(), 0);
    }

    #[test]
    fn restart_after_stop_recreates_resources() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:a", &ctx).build();
        let pool = started_pool(5);
        let handle = endpoint.as_endpoint();

        let before = pool.acquire(&handle).unwrap().unwrap();
        pool.stop().unwrap();
        assert!(before.is_stopped());
        assert!(pool.acquire(&handle).unwrap().is_none());

        pool.start().unwrap();
        let after = pool.acquire(&handle).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.is_started());
    }

    #[test]
    fn zero_capacity_disables_cache_and_idle_retention() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:multi", &ctx).singleton(false).build();
        let pool = started_pool(0);
        let handle = endpoint.as_endpoint();

        let producer = pool.acquire(&handle).unwrap().unwrap();
        pool.release(&handle, Arc::clone(&producer));
        assert!(producer.is_stopped());
        assert!(pool.cache_stats().is_none());
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn stopping_evicted_multi_pool_stops_checked_out_resources() {
        let ctx = Context::started("ctx");
        let multi = MockEndpoint::builder("mock:multi", &ctx).singleton(false).build();
        let single = MockEndpoint::builder("mock:single", &ctx).build();
        let pool = started_pool(1);
        let multi_handle = multi.as_endpoint();

        let m1 = pool.acquire(&multi_handle).unwrap().unwrap();
        let s = pool.acquire(&single.as_endpoint()).unwrap().unwrap();
        // m1 evicted while checked out, and its pool pushed over capacity
        assert!(m1.is_stopped());
        assert_eq!(multi.stops().get(), 1);
        assert_eq!(pool.pool_count(), 1);
        assert_eq!(ctx.service_count(), 1);

        pool.release(&multi_handle, m1);
        pool.clean_up();
        assert_eq!(multi.stops().get(), 1);

        pool.stop().unwrap();
        assert!(s.is_stopped());
        assert_eq!(ctx.service_count(), 0);
    }

    #[test]
    fn stopped_resources_are_never_handed_out_again() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:multi", &ctx).singleton(false).build();
        let pool = started_pool(5);
        let handle = endpoint.as_endpoint();

        let p1 = pool.acquire(&handle).unwrap().unwrap();
        pool.stop().unwrap();
        pool.start().unwrap();
        assert!(p1.is_stopped());

        let p2 = pool.acquire(&handle).unwrap().unwrap();
        pool.release(&handle, Arc::clone(&p1));
        pool.release(&handle, p2);
        assert_eq!(pool.size(), 1);

        let a = pool.acquire(&handle).unwrap().unwrap();
        let b = pool.acquire(&handle).unwrap().unwrap();
        for producer in [&a, &b] {
            assert!(producer.is_started());
            assert!(!Arc::ptr_eq(producer, &p1));
        }
        assert_eq!(endpoint.created(), 3);
    }

    #[test]
    fn evicted_single_pool_within_capacity_stops_on_next_acquire() {
        let ctx = Context::started("ctx");
        let single = MockEndpoint::builder("mock:single", &ctx).build();
        let multi = MockEndpoint::builder("mock:multi", &ctx).singleton(false).build();
        let pool = started_pool(2);
        let single_handle = single.as_endpoint();
        let multi_handle = multi.as_endpoint();

        let first = pool.acquire(&single_handle).unwrap().unwrap();
        pool.release(&single_handle, Arc::clone(&first));
        let _m1 = pool.acquire(&multi_handle).unwrap().unwrap();
        let _m2 = pool.acquire(&multi_handle).unwrap().unwrap();

        // evicted, but two pools fit the capacity: only marked
        assert!(first.is_started());
        assert_eq!(single.stops().get(), 0);
        assert_eq!(pool.pool_count(), 2);

        let second = pool.acquire(&single_handle).unwrap().unwrap();
        assert!(first.is_stopped());
        assert_eq!(single.stops().get(), 1);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_started());
        assert_eq!(single.created(), 2);
        assert_eq!(pool.pool_count(), 2);
    }
}
