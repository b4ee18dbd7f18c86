//! Bounded queue of interchangeable resources per endpoint.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::{Acquired, Shared, create_resource};
use crate::endpoint::{Endpoint, Pooled};
use crate::error::Result;
use crate::lifecycle::stop_and_deregister;

struct State<S: ?Sized> {
    idle: VecDeque<Arc<S>>,
    /// Resources the recency cache evicted that have not been stopped yet.
    evicted: Vec<Arc<S>>,
    retired: bool,
}

/// Hands each caller its own resource; retains up to `capacity` idle ones.
///
/// The bound applies to idle resources only: any number may be checked out
/// at once.
pub(crate) struct MultiPool<S: ?Sized> {
    id: u64,
    endpoint: Arc<dyn Endpoint>,
    capacity: usize,
    state: Mutex<State<S>>,
}

impl<S: ?Sized + Pooled> MultiPool<S> {
    pub(crate) fn new(id: u64, endpoint: Arc<dyn Endpoint>, capacity: usize) -> Self {
        Self {
            id,
            endpoint,
            capacity,
            state: Mutex::new(State {
                idle: VecDeque::with_capacity(capacity.min(64)),
                evicted: Vec::new(),
                retired: false,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn discard(&self, resource: Arc<S>) {
        stop_and_deregister(resource.into_service(), &*self.endpoint.authority());
    }

    /// Stop evicted resources that are idle. Evicted resources that are
    /// checked out stay buffered until they come back.
    fn drain_evicted(&self, state: &mut State<S>) {
        let State { idle, evicted, .. } = state;
        evicted.retain(|resource| {
            if let Some(pos) = idle.iter().position(|r| Arc::ptr_eq(r, resource)) {
                if let Some(resource) = idle.remove(pos) {
                    self.discard(resource);
                }
                false
            } else {
                !resource.is_stopped()
            }
        });
    }

    pub(crate) fn acquire(&self, shared: &Shared<S>) -> Result<Acquired<S>> {
        {
            let mut state = self.state.lock();
            if state.retired {
                return Ok(Acquired::Retired);
            }
            self.drain_evicted(&mut state);
            while let Some(resource) = state.idle.pop_front() {
                if resource.is_stopped() {
                    self.discard(resource);
                    continue;
                }
                return Ok(Acquired::Resource(resource));
            }
        }
        let resource = create_resource::<S>(&self.endpoint, shared.config(), false)?;
        Ok(Acquired::Resource(resource))
    }

    /// Return `resource` to the idle queue, or stop it if the queue is full,
    /// the resource was evicted or already stopped, or the pool was stopped.
    pub(crate) fn release(&self, _shared: &Shared<S>, resource: Arc<S>) {
        let mut state = self.state.lock();
        self.drain_evicted(&mut state);
        let evicted = state
            .evicted
            .iter()
            .position(|r| Arc::ptr_eq(r, &resource));
        if let Some(pos) = evicted {
            state.evicted.swap_remove(pos);
            trace!(endpoint = %self.endpoint.uri(), kind = S::KIND, "Stopping evicted resource on release");
            self.discard(resource);
        } else if state.retired
            || resource.is_stopped()
            || state.idle.len() >= self.capacity
        {
            self.discard(resource);
        } else {
            state.idle.push_back(resource);
        }
    }

    pub(crate) fn evict(&self, resource: Arc<S>) {
        let mut state = self.state.lock();
        if !state.evicted.iter().any(|r| Arc::ptr_eq(r, &resource)) {
            state.evicted.push(resource);
        }
    }

    pub(crate) fn clean_up(&self) {
        let mut state = self.state.lock();
        self.drain_evicted(&mut state);
    }

    pub(crate) fn stop(&self, shared: &Shared<S>) {
        let (idle, evicted) = {
            let mut state = self.state.lock();
            state.retired = true;
            (std::mem::take(&mut state.idle), std::mem::take(&mut state.evicted))
        };
        // evicted resources still checked out are no longer tracked anywhere
        for resource in idle.into_iter().chain(evicted) {
            self.discard(resource);
        }
        shared.remove_pool(self.endpoint.uri(), self.id);
    }

    pub(crate) fn size(&self) -> usize {
        self.state.lock().idle.len()
    }
}
