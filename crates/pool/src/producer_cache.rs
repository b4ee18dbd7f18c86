//! Producer cache: pooled access to producers plus send helpers.
//!
//! The cache is the entry point used by the routing engine to send an
//! exchange to an endpoint. It acquires a producer, hands it the exchange,
//! and always releases it again. Processing failures never escape a send:
//! they are recorded on the exchange.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::config::CacheSize;
use crate::context::Context;
use crate::endpoint::{AsyncCallback, Endpoint, Processor, Producer};
use crate::error::{Error, Result};
use crate::events::PoolEvent;
use crate::exchange::{Exchange, TO_ENDPOINT};
use crate::facade::ResourceCache;
use crate::lifecycle::{Service, ServiceStatus};
use crate::statistics::EndpointUtilizationStatistics;

/// Pooled (or uncached) producers for any number of endpoints.
///
/// Cloning is cheap; clones share the same pools.
#[derive(Clone)]
pub struct ProducerCache {
    inner: Arc<ResourceCache<dyn Producer>>,
}

impl std::fmt::Debug for ProducerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerCache")
            .field("pooled", &self.inner.is_pooled())
            .field("capacity", &self.inner.capacity())
            .field("size", &self.inner.size())
            .field("status", &self.inner.status())
            .finish()
    }
}

/// Emits sent/failed events for one exchange.
struct SendWatch {
    uri: String,
    started: Instant,
}

impl SendWatch {
    fn begin(context: &Context, uri: &str, exchange: &Exchange) -> Option<Self> {
        if !context.config().event_notification {
            return None;
        }
        context.events().emit(PoolEvent::ExchangeSending {
            endpoint: uri.to_string(),
            exchange_id: exchange.id(),
        });
        Some(Self {
            uri: uri.to_string(),
            started: Instant::now(),
        })
    }

    fn finish(self, context: &Context, exchange: &Exchange) {
        let event = match exchange.error() {
            Some(error) => PoolEvent::ExchangeFailed {
                endpoint: self.uri,
                exchange_id: exchange.id(),
                error: error.to_string(),
            },
            None => PoolEvent::ExchangeSent {
                endpoint: self.uri,
                exchange_id: exchange.id(),
                elapsed: self.started.elapsed(),
            },
        };
        context.events().emit(event);
    }
}

/// A checked-out producer that goes back to its cache when dropped, even
/// while unwinding.
struct ProducerLease {
    cache: ProducerCache,
    endpoint: Arc<dyn Endpoint>,
    producer: Option<Arc<dyn Producer>>,
}

impl ProducerLease {
    fn new(
        cache: &ProducerCache,
        endpoint: &Arc<dyn Endpoint>,
        producer: Arc<dyn Producer>,
    ) -> Self {
        Self {
            cache: cache.clone(),
            endpoint: Arc::clone(endpoint),
            producer: Some(producer),
        }
    }
}

impl Drop for ProducerLease {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            self.cache.release_producer(&self.endpoint, producer);
        }
    }
}

impl ProducerCache {
    /// Create a cache sized by `size`.
    ///
    /// [`CacheSize::Disabled`] yields an uncached variant that creates a new
    /// producer per send and stops it afterwards.
    ///
    /// # Errors
    /// Fails if the derived statistics capacity is invalid.
    pub fn new(context: Arc<Context>, size: CacheSize) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(ResourceCache::new(context, size)?),
        })
    }

    /// Acquire a producer for `endpoint`.
    ///
    /// # Errors
    /// [`Error::FailedToCreateProducer`] if the endpoint cannot create or
    /// start one, [`Error::RejectedExecution`] if the cache is not started.
    pub fn acquire_producer(&self, endpoint: &Arc<dyn Endpoint>) -> Result<Arc<dyn Producer>> {
        self.inner.acquire(endpoint)
    }

    /// Give a producer back. Never fails.
    pub fn release_producer(&self, endpoint: &Arc<dyn Endpoint>, producer: Arc<dyn Producer>) {
        self.inner.release(endpoint, producer);
    }

    /// Send `exchange` to `endpoint` and wait for the producer to finish.
    ///
    /// Processing errors from the producer or `result_processor` are recorded
    /// on the returned exchange, not returned.
    ///
    /// # Errors
    /// [`Error::RejectedExecution`] if the context is stopped; creation
    /// failures from [`ProducerCache::acquire_producer`].
    pub fn send(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        exchange: Exchange,
        result_processor: Option<&dyn Processor>,
    ) -> Result<Exchange> {
        self.inner.ensure_context_running()?;
        let producer = self.acquire_producer(endpoint)?;
        let lease = ProducerLease::new(self, endpoint, Arc::clone(&producer));

        let context = self.inner.context();
        exchange.set_property(TO_ENDPOINT, endpoint.uri());
        let watch = SendWatch::begin(context, endpoint.uri(), &exchange);
        if let Err(e) = producer.process(&exchange) {
            exchange.set_error(e);
        }
        if let Some(processor) = result_processor
            && let Err(e) = processor.process(&exchange)
        {
            exchange.set_error(e);
        }
        if let Some(watch) = watch {
            watch.finish(context, &exchange);
        }

        drop(lease);
        Ok(exchange)
    }

    /// Acquire a producer and let `producer_callback` drive it asynchronously.
    ///
    /// The producer is released and `callback` invoked exactly once, when the
    /// wrapped callback handed to `producer_callback` completes. If the
    /// wrapped callback is dropped without being called, the producer is
    /// still released but `callback` never runs. If no
    /// producer can be acquired the error is recorded on the exchange and
    /// `callback` runs immediately with `done(true)`.
    ///
    /// Returns `true` when everything completed synchronously.
    pub fn do_in_async_producer<F>(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        exchange: &Exchange,
        callback: AsyncCallback,
        producer_callback: F,
    ) -> bool
    where
        F: FnOnce(Arc<dyn Producer>, &Exchange, AsyncCallback) -> bool,
    {
        if !self.inner.is_started() {
            warn!(
                endpoint = %endpoint.uri(),
                exchange_id = %exchange.id(),
                "Ignoring exchange sent after producer cache is stopped"
            );
            exchange.set_error(Error::rejected("producer cache is stopped"));
            callback.done(true);
            return true;
        }
        let producer = match self.acquire_producer(endpoint) {
            Ok(producer) => producer,
            Err(e) => {
                exchange.set_error(e);
                callback.done(true);
                return true;
            }
        };

        exchange.set_property(TO_ENDPOINT, endpoint.uri());
        let watch = SendWatch::begin(self.inner.context(), endpoint.uri(), exchange);
        let lease = ProducerLease::new(self, endpoint, Arc::clone(&producer));
        let observed = exchange.clone();
        let wrapped = AsyncCallback::new(move |done_sync| {
            if let Some(watch) = watch {
                watch.finish(lease.cache.inner.context(), &observed);
            }
            let owned_endpoint = Arc::clone(&lease.endpoint);
            drop(lease);
            trace!(endpoint = %owned_endpoint.uri(), done_sync, "Async send completed");
            callback.done(done_sync);
        });
        producer_callback(producer, exchange, wrapped)
    }

    /// Send `exchange` asynchronously.
    ///
    /// The returned future always resolves to the exchange, carrying an error
    /// if acquiring, processing or `result_processor` failed.
    pub fn async_send_exchange(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        exchange: Exchange,
        result_processor: Option<Arc<dyn Processor>>,
    ) -> impl Future<Output = Exchange> + Send + 'static + use<> {
        let (tx, rx) = oneshot::channel();
        let completed = exchange.clone();
        let callback = AsyncCallback::new(move |_| {
            if let Some(processor) = result_processor
                && !completed.is_failed()
                && let Err(e) = processor.process(&completed)
            {
                completed.set_error(e);
            }
            // receiver dropped: nobody is waiting
            let _ = tx.send(completed);
        });
        self.do_in_async_producer(endpoint, &exchange, callback, |producer, exchange, done| {
            producer.process_async(exchange, done)
        });
        async move { rx.await.unwrap_or(exchange) }
    }

    /// Resources currently pooled.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Configured capacity; zero for the uncached variant.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Whether producers are pooled.
    pub fn is_pooled(&self) -> bool {
        self.inner.is_pooled()
    }

    /// Stop every pooled producer and start afresh.
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

impl Service for ProducerCache {
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
        "ProducerCache".to_string()
    }
}
