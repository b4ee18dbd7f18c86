//! Capability traits supplied by the routing engine.
//!
//! The pools never look inside an endpoint: they only ask it to create
//! producers or polling consumers, whether its producers may be shared, and
//! which [`LifecycleAuthority`] tracks the resources it creates.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::context::LifecycleAuthority;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangePattern};
use crate::lifecycle::Service;

/// A destination that can create producers and polling consumers.
///
/// The URI is the endpoint's identity: pools are keyed by it.
pub trait Endpoint: Send + Sync {
    /// URI identifying the endpoint.
    fn uri(&self) -> &str;

    /// Lifecycle authority that registers resources created for this endpoint.
    fn authority(&self) -> Arc<dyn LifecycleAuthority>;

    /// Create a new, not yet started producer.
    fn create_producer(self: Arc<Self>) -> Result<Arc<dyn Producer>>;

    /// Create a new, not yet started polling consumer.
    fn create_polling_consumer(self: Arc<Self>) -> Result<Arc<dyn PollingConsumer>>;

    /// Whether a single producer instance may be shared by all callers.
    fn is_singleton_producer(&self) -> bool {
        true
    }

    /// Create an exchange suitable for this endpoint.
    fn create_exchange(&self, pattern: ExchangePattern) -> Exchange {
        Exchange::new(pattern)
    }
}

impl fmt::Debug for dyn Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("uri", &self.uri()).finish()
    }
}

/// Completion callback for asynchronous processing.
///
/// `done(true)` means the work completed on the calling thread.
pub struct AsyncCallback(Box<dyn FnOnce(bool) + Send>);

impl AsyncCallback {
    /// Wrap a closure.
    pub fn new(f: impl FnOnce(bool) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Signal completion.
    pub fn done(self, done_sync: bool) {
        (self.0)(done_sync);
    }
}

impl fmt::Debug for AsyncCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncCallback")
    }
}

/// Something that can work on an exchange.
pub trait Processor: Send + Sync {
    /// Process the exchange.
    fn process(&self, exchange: &Exchange) -> Result<()>;
}

impl<F> Processor for F
where
    F: Fn(&Exchange) -> Result<()> + Send + Sync,
{
    fn process(&self, exchange: &Exchange) -> Result<()> {
        self(exchange)
    }
}

/// Sends exchanges to one endpoint.
pub trait Producer: Service {
    /// The endpoint this producer is bound to.
    fn endpoint(&self) -> Arc<dyn Endpoint>;

    /// Whether this instance tolerates concurrent callers.
    fn is_singleton(&self) -> bool {
        true
    }

    /// Process the exchange synchronously.
    fn process(&self, exchange: &Exchange) -> Result<()>;

    /// Process the exchange, signalling completion through `callback`.
    ///
    /// Returns `true` when processing completed synchronously. The default
    /// runs [`Producer::process`] inline and records any error on the exchange.
    fn process_async(&self, exchange: &Exchange, callback: AsyncCallback) -> bool {
        if let Err(e) = self.process(exchange) {
            exchange.set_error(e);
        }
        callback.done(true);
        true
    }
}

impl fmt::Debug for dyn Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("endpoint", &self.endpoint().uri())
            .field("status", &self.status())
            .finish()
    }
}

/// Pulls exchanges from one endpoint.
pub trait PollingConsumer: Service {
    /// The endpoint this consumer is bound to.
    fn endpoint(&self) -> Arc<dyn Endpoint>;

    /// Wait until an exchange is available.
    fn receive(&self) -> Option<Exchange>;

    /// Return an exchange if one is immediately available.
    fn receive_no_wait(&self) -> Option<Exchange>;

    /// Wait up to `timeout` for an exchange.
    fn receive_timeout(&self, timeout: Duration) -> Option<Exchange>;
}

impl fmt::Debug for dyn PollingConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingConsumer")
            .field("endpoint", &self.endpoint().uri())
            .field("status", &self.status())
            .finish()
    }
}

/// A resource type the coordinator knows how to create and manage.
///
/// Implemented for `dyn Producer` and `dyn PollingConsumer`.
pub trait Pooled: Service {
    /// Kind of resource, used in logs.
    const KIND: &'static str;

    /// Whether a disabled cache size means "create one per use" for this
    /// kind. Kinds that do not support that fall back to the context default.
    const UNCACHED_WHEN_DISABLED: bool;

    /// Ask `endpoint` for a fresh instance.
    fn create(endpoint: Arc<dyn Endpoint>) -> Result<Arc<Self>>;

    /// Wrap a creation or start failure for `endpoint`.
    fn creation_failed(endpoint: &str, source: Error) -> Error;

    /// Endpoint the instance belongs to.
    fn owning_endpoint(&self) -> Arc<dyn Endpoint>;

    /// View the instance as a plain service.
    fn into_service(self: Arc<Self>) -> Arc<dyn Service>;
}

impl Pooled for dyn Producer {
    const KIND: &'static str = "producer";
    const UNCACHED_WHEN_DISABLED: bool = true;

    fn create(endpoint: Arc<dyn Endpoint>) -> Result<Arc<Self>> {
        endpoint.create_producer()
    }

    fn creation_failed(endpoint: &str, source: Error) -> Error {
        Error::failed_to_create_producer(endpoint, source)
    }

    fn owning_endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint()
    }

    fn into_service(self: Arc<Self>) -> Arc<dyn Service> {
        self
    }
}

impl Pooled for dyn PollingConsumer {
    const KIND: &'static str = "consumer";
    const UNCACHED_WHEN_DISABLED: bool = false;

    fn create(endpoint: Arc<dyn Endpoint>) -> Result<Arc<Self>> {
        endpoint.create_polling_consumer()
    }

    fn creation_failed(endpoint: &str, source: Error) -> Error {
        Error::failed_to_create_consumer(endpoint, source)
    }

    fn owning_endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint()
    }

    fn into_service(self: Arc<Self>) -> Arc<dyn Service> {
        self
    }
}
