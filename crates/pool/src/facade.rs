//! Acquire/release plumbing shared by the producer and consumer caches.

use std::sync::Arc;

use tracing::debug;

use crate::config::CacheSize;
use crate::context::Context;
use crate::endpoint::{Endpoint, Pooled};
use crate::error::{Error, Result};
use crate::lifecycle::{Service, ServiceStatus, ServiceSupport, stop_and_deregister};
use crate::pool::{ServicePool, create_resource};
use crate::statistics::EndpointUtilizationStatistics;

enum Mode<S: ?Sized + Pooled> {
    /// Resources are pooled per endpoint.
    Pooled(ServicePool<S>),
    /// A fresh resource per acquire, stopped on release.
    Uncached,
}

/// Pooled or uncached resource source bound to a context.
pub(crate) struct ResourceCache<S: ?Sized + Pooled> {
    context: Arc<Context>,
    mode: Mode<S>,
    capacity: usize,
    statistics: Option<EndpointUtilizationStatistics>,
    status: ServiceSupport,
}

impl<S> ResourceCache<S>
where
    S: ?Sized + Pooled + 'static,
{
    pub(crate) fn new(context: Arc<Context>, size: CacheSize) -> Result<Self> {
        let capacity = size.resolve(context.max_pool_size());
        let statistics = if context.config().extended_statistics {
            Some(EndpointUtilizationStatistics::new(capacity)?)
        } else {
            None
        };
        let uncached = size.is_disabled() && S::UNCACHED_WHEN_DISABLED;
        let mode = if uncached {
            Mode::Uncached
        } else {
            Mode::Pooled(ServicePool::new(capacity, context.config().pool.clone()))
        };
        debug!(kind = S::KIND, capacity, pooled = !uncached, "Created resource cache");
        Ok(Self {
            context,
            mode,
            capacity,
            statistics,
            status: ServiceSupport::new(),
        })
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Fail with [`Error::RejectedExecution`] if the context is stopped.
    pub(crate) fn ensure_context_running(&self) -> Result<()> {
        if self.context.is_stopped() {
            return Err(Error::rejected(format!(
                "context '{}' is stopped",
                self.context.name()
            )));
        }
        Ok(())
    }

    pub(crate) fn acquire(&self, endpoint: &Arc<dyn Endpoint>) -> Result<Arc<S>> {
        let acquired = match &self.mode {
            Mode::Pooled(pool) => pool
                .acquire(endpoint)
                .map_err(|e| S::creation_failed(endpoint.uri(), e))?,
            Mode::Uncached if self.status.status() == ServiceStatus::Started => Some(
                create_resource::<S>(endpoint, &self.context.config().pool, false)
                    .map_err(|e| S::creation_failed(endpoint.uri(), e))?,
            ),
            Mode::Uncached => None,
        };
        let Some(resource) = acquired else {
            return Err(Error::rejected(format!("{} cache is not started", S::KIND)));
        };
        if let Some(statistics) = &self.statistics {
            statistics.on_hit(endpoint.uri());
        }
        Ok(resource)
    }

    pub(crate) fn release(&self, endpoint: &Arc<dyn Endpoint>, resource: Arc<S>) {
        match &self.mode {
            Mode::Pooled(pool) => pool.release(endpoint, resource),
            Mode::Uncached => {
                stop_and_deregister(resource.into_service(), &*endpoint.authority());
            }
        }
    }

    pub(crate) fn size(&self) -> usize {
        match &self.mode {
            Mode::Pooled(pool) => pool.size(),
            Mode::Uncached => 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        match &self.mode {
            Mode::Pooled(_) => self.capacity,
            Mode::Uncached => 0,
        }
    }

    pub(crate) fn is_pooled(&self) -> bool {
        matches!(self.mode, Mode::Pooled(_))
    }

    pub(crate) fn clean_up(&self) {
        if let Mode::Pooled(pool) = &self.mode {
            pool.clean_up();
        }
    }

    /// Drop every pooled resource by restarting the pool.
    pub(crate) fn purge(&self) -> Result<()> {
        if let Mode::Pooled(pool) = &self.mode {
            pool.stop()?;
            pool.start()?;
        }
        if let Some(statistics) = &self.statistics {
            statistics.clear();
        }
        Ok(())
    }

    pub(crate) fn statistics(&self) -> Option<&EndpointUtilizationStatistics> {
        self.statistics.as_ref()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.status.status() == ServiceStatus::Started
    }

    pub(crate) fn start(&self) -> Result<()> {
        self.status
            .start_with(|| {
                if let Some(statistics) = &self.statistics {
                    statistics.clear();
                }
                match &self.mode {
                    Mode::Pooled(pool) => pool.start(),
                    Mode::Uncached => Ok(()),
                }
            })
            .map(|_| ())
    }

    pub(crate) fn stop(&self) -> Result<()> {
        self.status
            .stop_with(|| {
                if let Some(statistics) = &self.statistics {
                    statistics.clear();
                }
                match &self.mode {
                    Mode::Pooled(pool) => pool.stop(),
                    Mode::Uncached => Ok(()),
                }
            })
            .map(|_| ())
    }

    pub(crate) fn status(&self) -> ServiceStatus {
        self.status.status()
    }
}
