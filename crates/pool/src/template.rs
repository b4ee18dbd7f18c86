//! Convenience sender addressing endpoints by URI.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::trace;

use crate::cache::WeakCache;
use crate::config::CacheSize;
use crate::context::Context;
use crate::endpoint::{Endpoint, Processor};
use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangePattern};
use crate::lifecycle::{Service, ServiceStatus};
use crate::producer_cache::ProducerCache;

/// Looks up an endpoint by URI.
pub type EndpointResolver = Arc<dyn Fn(&str) -> Result<Arc<dyn Endpoint>> + Send + Sync>;

/// Sends bodies and exchanges to endpoints given by URI.
///
/// Resolved endpoints are remembered without being owned: once nothing else
/// holds an endpoint it is resolved again on the next send.
pub struct ProducerTemplate {
    resolver: EndpointResolver,
    endpoints: WeakCache<String, dyn Endpoint>,
    producers: ProducerCache,
}

impl std::fmt::Debug for ProducerTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerTemplate")
            .field("producers", &self.producers)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl ProducerTemplate {
    /// Create a template over a producer cache sized by `maximum_cache_size`.
    ///
    /// # Errors
    /// Fails if the producer cache cannot be created.
    pub fn new(
        context: Arc<Context>,
        resolver: EndpointResolver,
        maximum_cache_size: CacheSize,
    ) -> Result<Self> {
        Ok(Self {
            resolver,
            endpoints: WeakCache::new(),
            producers: ProducerCache::new(context, maximum_cache_size)?,
        })
    }

    /// Resolve `uri` to an endpoint.
    ///
    /// # Errors
    /// Propagates resolver failures.
    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn Endpoint>> {
        if let Some(endpoint) = self.endpoints.get(uri) {
            return Ok(endpoint);
        }
        let endpoint = (self.resolver)(uri)?;
        trace!(endpoint = %uri, "Resolved endpoint");
        Ok(self
            .endpoints
            .put_if_absent(uri.to_string(), &endpoint)
            .unwrap_or(endpoint))
    }

    /// Send `exchange` to `uri`. Processing errors stay on the exchange.
    ///
    /// # Errors
    /// Resolution, rejection and creation failures.
    pub fn send(&self, uri: &str, exchange: Exchange) -> Result<Exchange> {
        let endpoint = self.resolve(uri)?;
        self.producers.send(&endpoint, exchange, None)
    }

    /// Send `exchange` to `uri`, then run `processor` on the result.
    ///
    /// # Errors
    /// See [`ProducerTemplate::send`].
    pub fn send_with(
        &self,
        uri: &str,
        exchange: Exchange,
        processor: &dyn Processor,
    ) -> Result<Exchange> {
        let endpoint = self.resolve(uri)?;
        self.producers.send(&endpoint, exchange, Some(processor))
    }

    /// Fire-and-forget `body` to `uri`.
    ///
    /// # Errors
    /// [`Error::Execution`] if the exchange failed, plus everything
    /// [`ProducerTemplate::send`] returns.
    pub fn send_body(&self, uri: &str, body: impl Into<Value>) -> Result<()> {
        let exchange = self.send(uri, Exchange::with_body(ExchangePattern::InOnly, body))?;
        extract_failure(uri, &exchange)
    }

    /// Send `body` to `uri` and return the reply body.
    ///
    /// # Errors
    /// See [`ProducerTemplate::send_body`].
    pub fn request_body(&self, uri: &str, body: impl Into<Value>) -> Result<Option<Value>> {
        let exchange = self.send(uri, Exchange::with_body(ExchangePattern::InOut, body))?;
        extract_failure(uri, &exchange)?;
        Ok(exchange.take_body())
    }

    /// Send `body` to `uri` asynchronously.
    ///
    /// # Errors
    /// Only endpoint resolution fails here; everything later is recorded on
    /// the exchange the future resolves to.
    pub fn async_send_body<B: Into<Value>>(
        &self,
        uri: &str,
        body: B,
    ) -> Result<impl Future<Output = Exchange> + Send + 'static + use<B>> {
        let endpoint = self.resolve(uri)?;
        let exchange = Exchange::with_body(ExchangePattern::InOnly, body);
        Ok(self.producers.async_send_exchange(&endpoint, exchange, None))
    }

    /// Producers currently pooled.
    pub fn current_cache_size(&self) -> usize {
        self.producers.size()
    }

    /// Bound on pooled producers.
    pub fn maximum_cache_size(&self) -> usize {
        self.producers.capacity()
    }

    /// Drop dead endpoint references and process pending evictions.
    pub fn clean_up(&self) {
        self.endpoints.purge();
        self.producers.clean_up();
    }

    /// The underlying producer cache.
    pub fn producer_cache(&self) -> &ProducerCache {
        &self.producers
    }
}

fn extract_failure(uri: &str, exchange: &Exchange) -> Result<()> {
    match exchange.error() {
        Some(source) => Err(Error::Execution {
            endpoint: uri.to_string(),
            source,
        }),
        None => Ok(()),
    }
}

impl Service for ProducerTemplate {
    fn start(&self) -> Result<()> {
        self.producers.start()
    }

    fn stop(&self) -> Result<()> {
        self.endpoints.clear();
        self.producers.stop()
    }

    fn status(&self) -> ServiceStatus {
        self.producers.status()
    }

    fn name(&self) -> String {
        "ProducerTemplate".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEndpoint;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Registry {
        endpoints: Mutex<HashMap<String, Arc<MockEndpoint>>>,
        lookups: AtomicUsize,
    }

    fn template_with(ctx: &Arc<Context>, endpoints: Vec<Arc<MockEndpoint>>) -> (ProducerTemplate, Arc<Registry>) {
        let registry = Arc::new(Registry {
            endpoints: Mutex::new(
                endpoints
                    .into_iter()
                    .map(|e| (e.uri().to_string(), e))
                    .collect(),
            ),
            lookups: AtomicUsize::new(0),
        });
        let lookup = Arc::clone(&registry);
        let resolver: EndpointResolver = Arc::new(move |uri: &str| {
            lookup.lookups.fetch_add(1, Ordering::SeqCst);
            lookup
                .endpoints
                .lock()
                .get(uri)
                .map(MockEndpoint::as_endpoint)
                .ok_or_else(|| Error::invalid_argument(format!("no endpoint {uri}")))
        });
        let template = ProducerTemplate::new(Arc::clone(ctx), resolver, CacheSize::Default).unwrap();
        template.start().unwrap();
        (template, registry)
    }

    #[test]
    fn request_body_returns_reply() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:echo", &ctx).build();
        let (template, _) = template_with(&ctx, vec![endpoint]);

        let reply = template.request_body("mock:echo", "hi").unwrap();
        assert_eq!(reply, Some(json!("reply: hi")));
        assert_eq!(template.current_cache_size(), 1);
        assert_eq!(template.maximum_cache_size(), 1000);
    }

    #[test]
    fn send_body_lifts_exchange_error() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:bad", &ctx).failing_process().build();
        let (template, _) = template_with(&ctx, vec![endpoint]);

        let err = template.send_body("mock:bad", json!({"id": 7})).unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
        assert_eq!(err.endpoint(), Some("mock:bad"));
    }

    #[test]
    fn unknown_uri_fails_resolution() {
        let ctx = Context::started("ctx");
        let (template, _) = template_with(&ctx, Vec::new());
        assert!(template.send_body("mock:none", 1).is_err());
    }

    #[test]
    fn resolved_endpoints_are_remembered_while_alive() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:a", &ctx).build();
        let (template, registry) = template_with(&ctx, vec![endpoint]);

        template.send_body("mock:a", 1).unwrap();
        template.send_body("mock:a", 2).unwrap();
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);

        // drop every strong reference: registry entry and the pooled producer
        registry.endpoints.lock().clear();
        template.producer_cache().purge().unwrap();
        template.clean_up();
        assert!(template.resolve("mock:a").is_err());
        assert_eq!(registry.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn async_send_body_resolves_to_exchange() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:a", &ctx).build();
        let (template, _) = template_with(&ctx, vec![Arc::clone(&endpoint)]);

        let exchange = template.async_send_body("mock:a", "x").unwrap().await;
        assert!(!exchange.is_failed());
        assert_eq!(endpoint.processed(), 1);
    }

    #[tokio::test]
    async fn async_send_body_future_can_be_spawned() {
        let ctx = Context::started("ctx");
        let endpoint = MockEndpoint::builder("mock:a", &ctx).build();
        let (template, _) = template_with(&ctx, vec![Arc::clone(&endpoint)]);

        let future = {
            let uri = String::from("mock:a");
            template.async_send_body(&uri, json!({"n": 1})).unwrap()
        };
        let exchange = tokio::spawn(future).await.unwrap();
        assert!(!exchange.is_failed());
        assert_eq!(endpoint.processed(), 1);
    }
}
