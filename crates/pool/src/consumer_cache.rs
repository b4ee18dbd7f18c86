//! Consumer cache: pooled polling consumers plus receive helpers.

use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheSize;
use crate::context::Context;
use crate::endpoint::{Endpoint, PollingConsumer};
use crate::error::Result;
use crate::exchange::Exchange;
use crate::facade::ResourceCache;
use crate::lifecycle::{Service, ServiceStatus};
use crate::statistics::EndpointUtilizationStatistics;

/// Pooled polling consumers for any number of endpoints.
#[derive(Clone)]
pub struct ConsumerCache {
    inner: Arc<ResourceCache<dyn PollingConsumer>>,
}

impl std::fmt::Debug for ConsumerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerCache")
            .field("capacity", &self.inner.capacity())
            .field("size", &self.inner.size())
            .field("status", &self.inner.status())
            .finish()
    }
}

impl ConsumerCache {
    /// Create a cache sized by `size`.
    ///
    /// # Errors
    /// Fails if the derived statistics capacity is invalid.
    pub fn new(context: Arc<Context>, size: CacheSize) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(ResourceCache::new(context, size)?),
        })
    }

    /// Acquire a polling consumer for `endpoint`.
    ///
    /// # Errors
    /// [`crate::Error::FailedToCreateConsumer`] if the endpoint cannot create
    /// or start one, [`crate::Error::RejectedExecution`] if the cache is not
    /// started.
    pub fn acquire_polling_consumer(
        &self,
        endpoint: &Arc<dyn Endpoint>,
    ) -> Result<Arc<dyn PollingConsumer>> {
        self.inner.acquire(endpoint)
    }

    /// Give a consumer back. Never fails.
    pub fn release_polling_consumer(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        consumer: Arc<dyn PollingConsumer>,
    ) {
        self.inner.release(endpoint, consumer);
    }

    fn with_consumer(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        poll: impl FnOnce(&dyn PollingConsumer) -> Option<Exchange>,
    ) -> Result<Option<Exchange>> {
        self.inner.ensure_context_running()?;
        let consumer = self.acquire_polling_consumer(endpoint)?;
        let received = poll(&*consumer);
        self.release_polling_consumer(endpoint, consumer);
        Ok(received)
    }

    /// Wait until `endpoint` yields an exchange.
    ///
    /// # Errors
    /// [`crate::Error::RejectedExecution`] if the context is stopped; creation
    /// failures from [`ConsumerCache::acquire_polling_consumer`].
    pub fn receive(&self, endpoint: &Arc<dyn Endpoint>) -> Result<Option<Exchange>> {
        self.with_consumer(endpoint, |consumer| consumer.receive())
    }

    /// Wait up to `timeout` for an exchange.
    ///
    /// # Errors
    /// See [`ConsumerCache::receive`].
    pub fn receive_timeout(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        timeout: Duration,
    ) -> Result<Option<Exchange>> {
        self.with_consumer(endpoint, |consumer| consumer.receive_timeout(timeout))
    }

    /// Take an exchange only if one is ready.
    ///
    /// # Errors
    /// See [`ConsumerCache::receive`].
    pub fn receive_no_wait(&self, endpoint: &Arc<dyn Endpoint>) -> Result<Option<Exchange>> {
        self.with_consumer(endpoint, |consumer| consumer.receive_no_wait())
    }

    /// Consumers currently pooled.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Stop every pooled consumer and start afresh.
    ///
    /// # Errors
    /// Propagates pool lifecycle failures.
    pub fn purge(&self) -> Result<()> {
        self.inner.purge()
    }

    /// Process pending evictions now.
    pub fn clean_up(&self) {
        self.inner.clean_up();
    }

    /// Per-endpoint usage, when extended statistics are enabled.
    pub fn statistics(&self) -> Option<&EndpointUtilizationStatistics> {
        self.inner.statistics()
    }
}

impl Service for ConsumerCache {
    fn start(&self) -> Result<()> {
        self.inner.start()
    }

    fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    fn status(&self) -> ServiceStatus {
        self.inner.status()
    }

    fn name(&self) -> String {
        "ConsumerCache".to_string()
    }
}
