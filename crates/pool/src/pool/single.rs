//! One shared resource per endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{Acquired, Shared, create_resource};
use crate::endpoint::{Endpoint, Pooled};
use crate::error::Result;
use crate::lifecycle::stop_and_deregister;

/// Holds at most one resource, created on first acquire and shared by every
/// caller until the pool is evicted or stopped.
pub(crate) struct SinglePool<S: ?Sized> {
    id: u64,
    endpoint: Arc<dyn Endpoint>,
    resource: RwLock<Option<Arc<S>>>,
    create_lock: Mutex<()>,
    retired: AtomicBool,
}

impl<S: ?Sized + Pooled> SinglePool<S> {
    pub(crate) fn new(id: u64, endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            id,
            endpoint,
            resource: RwLock::new(None),
            create_lock: Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn current(&self) -> Option<Arc<S>> {
        self.resource.read().clone()
    }

    pub(crate) fn acquire(&self, shared: &Shared<S>) -> Result<Acquired<S>> {
        self.clean_up(shared);
        if self.retired.load(Ordering::Acquire) {
            return Ok(Acquired::Retired);
        }
        if let Some(resource) = self.current() {
            return Ok(Acquired::Resource(resource));
        }

        let _guard = self.create_lock.lock();
        if self.retired.load(Ordering::Acquire) {
            return Ok(Acquired::Retired);
        }
        if let Some(resource) = self.current() {
            return Ok(Acquired::Resource(resource));
        }
        let resource = create_resource::<S>(&self.endpoint, shared.config(), true)?;
        *self.resource.write() = Some(Arc::clone(&resource));
        Ok(Acquired::Resource(resource))
    }

    /// The resource stays resident; only pending eviction is processed.
    pub(crate) fn release(&self, shared: &Shared<S>, resource: Arc<S>) {
        if self.retired.load(Ordering::Acquire) {
            stop_and_deregister(resource.into_service(), &*self.endpoint.authority());
            return;
        }
        self.clean_up(shared);
    }

    /// Mark the pool for eviction. Nothing is stopped here.
    ///
    /// A resource that is no longer this pool's current one is an orphan of
    /// an earlier pool for the same endpoint and is stopped directly.
    pub(crate) fn evict(&self, shared: &Shared<S>, resource: Arc<S>) {
        let current = self.current();
        if current.is_some_and(|c| Arc::ptr_eq(&c, &resource)) {
            shared.mark_single_evicted(self.endpoint.uri(), self.id);
        } else {
            stop_and_deregister(resource.into_service(), &*self.endpoint.authority());
        }
    }

    pub(crate) fn clean_up(&self, shared: &Shared<S>) {
        if shared.take_single_evicted(self.endpoint.uri(), self.id) {
            trace!(endpoint = %self.endpoint.uri(), kind = S::KIND, "Stopping evicted single pool");
            self.stop(shared);
        }
    }

    pub(crate) fn stop(&self, shared: &Shared<S>) {
        self.retired.store(true, Ordering::Release);
        let resource = {
            let _guard = self.create_lock.lock();
            self.resource.write().take()
        };
        if let Some(resource) = resource {
            stop_and_deregister(resource.into_service(), &*self.endpoint.authority());
        }
        shared.remove_pool(self.endpoint.uri(), self.id);
        shared.take_single_evicted(self.endpoint.uri(), self.id);
    }

    pub(crate) fn size(&self) -> usize {
        usize::from(self.resource.read().is_some())
    }
}
