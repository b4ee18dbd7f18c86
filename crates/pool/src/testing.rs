//! Testing utilities: counting endpoints, producers and consumers.
//!
//! These doubles count creations, stops and processed exchanges so tests can
//! assert on pool behaviour without global state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::Value;

use crate::context::LifecycleAuthority;
use crate::endpoint::{AsyncCallback, Endpoint, PollingConsumer, Producer};
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::lifecycle::{Service, ServiceStatus, ServiceSupport};

// ---------------------------------------------------------------------------
// StopCounter
// ---------------------------------------------------------------------------

/// Shared counter of stop transitions.
#[derive(Debug, Clone, Default)]
pub struct StopCounter(Arc<AtomicUsize>);

impl StopCounter {
    /// Current count.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockService
// ---------------------------------------------------------------------------

/// A bare service that can be told to fail on start.
#[derive(Debug, Default)]
pub struct MockService {
    status: ServiceSupport,
    fail_start: bool,
    stops: StopCounter,
}

impl MockService {
    /// A service whose `start` always fails.
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    /// Stops observed so far.
    pub fn stops(&self) -> usize {
        self.stops.get()
    }
}

impl Service for MockService {
    fn start(&self) -> Result<()> {
        self.status
            .start_with(|| {
                if self.fail_start {
                    Err(Error::lifecycle("mock-service", "start refused"))
                } else {
                    Ok(())
                }
            })
            .map(|_| ())
    }

    fn stop(&self) -> Result<()> {
        self.status
            .stop_with(|| {
                self.stops.increment();
                Ok(())
            })
            .map(|_| ())
    }

    fn status(&self) -> ServiceStatus {
        self.status.status()
    }

    fn name(&self) -> String {
        "mock-service".to_string()
    }
}

// ---------------------------------------------------------------------------
// MockEndpoint
// ---------------------------------------------------------------------------

/// Builder for [`MockEndpoint`].
pub struct MockEndpointBuilder {
    uri: String,
    authority: Arc<dyn LifecycleAuthority>,
    singleton: bool,
    fail_create: bool,
    fail_process: bool,
    async_processing: Option<Duration>,
    start_delay: Option<Duration>,
    stops: StopCounter,
}

impl MockEndpointBuilder {
    /// Whether producers may be shared (default `true`).
    #[must_use]
    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    /// Make every producer/consumer creation fail.
    #[must_use]
    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    /// Make every producer fail while processing.
    #[must_use]
    pub fn failing_process(mut self) -> Self {
        self.fail_process = true;
        self
    }

    /// Complete asynchronous sends on a separate thread after `delay`.
    #[must_use]
    pub fn asynchronous(mut self, delay: Duration) -> Self {
        self.async_processing = Some(delay);
        self
    }

    /// Resources stay in the starting state for `delay` after `start`.
    #[must_use]
    pub fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Count stops of every resource created by this endpoint on `counter`.
    #[must_use]
    pub fn stop_counter(mut self, counter: StopCounter) -> Self {
        self.stops = counter;
        self
    }

    /// Build the endpoint.
    pub fn build(self) -> Arc<MockEndpoint> {
        Arc::new(MockEndpoint {
            uri: self.uri,
            authority: self.authority,
            singleton: self.singleton,
            fail_create: self.fail_create,
            fail_process: self.fail_process,
            async_processing: self.async_processing,
            start_delay: self.start_delay,
            stops: self.stops,
            created: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            inbox: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        })
    }
}

/// Endpoint double that creates [`MockProducer`]s and [`MockConsumer`]s.
pub struct MockEndpoint {
    uri: String,
    authority: Arc<dyn LifecycleAuthority>,
    singleton: bool,
    fail_create: bool,
    fail_process: bool,
    async_processing: Option<Duration>,
    start_delay: Option<Duration>,
    stops: StopCounter,
    created: AtomicUsize,
    processed: AtomicUsize,
    inbox: Mutex<VecDeque<Exchange>>,
    arrived: Condvar,
}

impl std::fmt::Debug for MockEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEndpoint")
            .field("uri", &self.uri)
            .field("singleton", &self.singleton)
            .finish_non_exhaustive()
    }
}

impl MockEndpoint {
    /// Start building an endpoint registered with `authority`.
    pub fn builder<A>(uri: impl Into<String>, authority: &Arc<A>) -> MockEndpointBuilder
    where
        A: LifecycleAuthority + 'static,
    {
        MockEndpointBuilder {
            uri: uri.into(),
            authority: Arc::clone(authority) as Arc<dyn LifecycleAuthority>,
            singleton: true,
            fail_create: false,
            fail_process: false,
            async_processing: None,
            start_delay: None,
            stops: StopCounter::default(),
        }
    }

    /// This endpoint as a trait object.
    pub fn as_endpoint(self: &Arc<Self>) -> Arc<dyn Endpoint> {
        Arc::clone(self) as Arc<dyn Endpoint>
    }

    /// Producers and consumers created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Exchanges processed by producers so far.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Stop counter shared by this endpoint's resources.
    pub fn stops(&self) -> StopCounter {
        self.stops.clone()
    }

    /// Make an exchange carrying `body` available to consumers.
    pub fn enqueue(&self, body: impl Into<Value>) {
        let exchange = Exchange::with_body(Default::default(), body);
        self.inbox.lock().push_back(exchange);
        self.arrived.notify_one();
    }

    fn take(&self, timeout: Option<Duration>) -> Option<Exchange> {
        let mut inbox = self.inbox.lock();
        let Some(timeout) = timeout else {
            return inbox.pop_front();
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exchange) = inbox.pop_front() {
                return Some(exchange);
            }
            if self.arrived.wait_until(&mut inbox, deadline).timed_out() {
                return inbox.pop_front();
            }
        }
    }

    fn check_create(&self) -> Result<()> {
        if self.fail_create {
            return Err(Error::internal(format!("cannot connect to {}", self.uri)));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Endpoint for MockEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn authority(&self) -> Arc<dyn LifecycleAuthority> {
        Arc::clone(&self.authority)
    }

    fn create_producer(self: Arc<Self>) -> Result<Arc<dyn Producer>> {
        self.check_create()?;
        Ok(Arc::new(MockProducer {
            endpoint: self,
            status: Arc::new(ServiceSupport::new()),
        }))
    }

    fn create_polling_consumer(self: Arc<Self>) -> Result<Arc<dyn PollingConsumer>> {
        self.check_create()?;
        Ok(Arc::new(MockConsumer {
            endpoint: self,
            status: ServiceSupport::new(),
        }))
    }

    fn is_singleton_producer(&self) -> bool {
        self.singleton
    }
}

// ---------------------------------------------------------------------------
// MockProducer
// ---------------------------------------------------------------------------

/// Producer double. Replies to in-out exchanges by echoing the body.
pub struct MockProducer {
    endpoint: Arc<MockEndpoint>,
    status: Arc<ServiceSupport>,
}

impl MockProducer {
    fn handle(&self, exchange: &Exchange) -> Result<()> {
        if self.endpoint.fail_process {
            return Err(Error::processing(&self.endpoint.uri, "mock processing failure"));
        }
        self.endpoint.processed.fetch_add(1, Ordering::SeqCst);
        exchange.set_header("processed_by", self.endpoint.uri.clone());
        if exchange.pattern() == crate::exchange::ExchangePattern::InOut {
            let reply = match exchange.body() {
                Some(Value::String(s)) => Value::String(format!("reply: {s}")),
                Some(other) => other,
                None => Value::Null,
            };
            exchange.set_body(reply);
        }
        Ok(())
    }
}

impl Service for MockProducer {
    fn start(&self) -> Result<()> {
        match self.endpoint.start_delay {
            Some(delay) => {
                if self.status.begin_start() {
                    let status = Arc::clone(&self.status);
                    thread::spawn(move || {
                        thread::sleep(delay);
                        if status.status() == ServiceStatus::Starting {
                            status.set_status(ServiceStatus::Started);
                        }
                    });
                }
                Ok(())
            }
            None => self.status.start_with(|| Ok(())).map(|_| ()),
        }
    }

    fn stop(&self) -> Result<()> {
        self.status
            .stop_with(|| {
                self.endpoint.stops.increment();
                Ok(())
            })
            .map(|_| ())
    }

    fn status(&self) -> ServiceStatus {
        self.status.status()
    }

    fn name(&self) -> String {
        format!("producer:{}", self.endpoint.uri)
    }
}

impl Producer for MockProducer {
    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint.as_endpoint()
    }

    fn is_singleton(&self) -> bool {
        self.endpoint.singleton
    }

    fn process(&self, exchange: &Exchange) -> Result<()> {
        self.handle(exchange)
    }

    fn process_async(&self, exchange: &Exchange, callback: AsyncCallback) -> bool {
        let Some(delay) = self.endpoint.async_processing else {
            if let Err(e) = self.handle(exchange) {
                exchange.set_error(e);
            }
            callback.done(true);
            return true;
        };
        let producer = Self {
            endpoint: Arc::clone(&self.endpoint),
            status: Arc::clone(&self.status),
        };
        let exchange = exchange.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if let Err(e) = producer.handle(&exchange) {
                exchange.set_error(e);
            }
            callback.done(false);
        });
        false
    }
}

// ---------------------------------------------------------------------------
// MockConsumer
// ---------------------------------------------------------------------------

/// Polling consumer double reading from its endpoint's inbox.
pub struct MockConsumer {
    endpoint: Arc<MockEndpoint>,
    status: ServiceSupport,
}

impl Service for MockConsumer {
    fn start(&self) -> Result<()> {
        self.status.start_with(|| Ok(())).map(|_| ())
    }

    fn stop(&self) -> Result<()> {
        self.status
            .stop_with(|| {
                self.endpoint.stops.increment();
                Ok(())
            })
            .map(|_| ())
    }

    fn status(&self) -> ServiceStatus {
        self.status.status()
    }

    fn name(&self) -> String {
        format!("consumer:{}", self.endpoint.uri)
    }
}

impl PollingConsumer for MockConsumer {
    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint.as_endpoint()
    }

    fn receive(&self) -> Option<Exchange> {
        loop {
            if let Some(exchange) = self.endpoint.take(Some(Duration::from_millis(50))) {
                return Some(exchange);
            }
            if self.is_stopped() {
                return None;
            }
        }
    }

    fn receive_no_wait(&self) -> Option<Exchange> {
        self.endpoint.take(None)
    }

    fn receive_timeout(&self, timeout: Duration) -> Option<Exchange> {
        self.endpoint.take(Some(timeout))
    }
}
