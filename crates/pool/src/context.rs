//! Lifecycle authority and the default routing context.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::lifecycle::{Service, ServiceStatus, ServiceSupport, service_key};

/// The owner responsible for starting, stopping and tracking managed services.
///
/// Pools register every resource they create here and deregister every
/// resource they stop.
pub trait LifecycleAuthority: Send + Sync {
    /// Register a service, starting it when `autostart` is set.
    ///
    /// `enlist` marks the service as visible to management tooling.
    fn add_service(&self, service: Arc<dyn Service>, autostart: bool, enlist: bool) -> Result<()>;

    /// Deregister a service. Returns whether it was registered.
    fn remove_service(&self, service: &Arc<dyn Service>) -> Result<bool>;
}

struct Registration {
    service: Arc<dyn Service>,
    managed: bool,
}

/// Default execution context: a lifecycle authority plus the settings and
/// event bus shared by the caches built on it.
pub struct Context {
    name: String,
    config: ContextConfig,
    services: DashMap<usize, Registration>,
    events: EventBus,
    status: ServiceSupport,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("status", &self.status.status())
            .field("services", &self.services.len())
            .finish()
    }
}

impl Context {
    /// Create a context with the given name and configuration.
    pub fn new(name: impl Into<String>, config: ContextConfig) -> Self {
        Self {
            name: name.into(),
            config,
            services: DashMap::new(),
            events: EventBus::default(),
            status: ServiceSupport::new(),
        }
    }

    /// Create and start a context with default configuration.
    pub fn started(name: impl Into<String>) -> Arc<Self> {
        let ctx = Arc::new(Self::new(name, ContextConfig::default()));
        // starting an empty context cannot fail
        let _ = ctx.start();
        ctx
    }

    /// Name of the context.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settings shared by caches built on this context.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Event bus for send/sent notifications.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Context-wide default bound used when a cache size of zero or less is requested.
    pub fn max_pool_size(&self) -> usize {
        self.config.max_pool_size
    }

    /// Number of registered services.
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of registered services enlisted for management.
    pub fn managed_count(&self) -> usize {
        self.services.iter().filter(|r| r.managed).count()
    }

    /// Whether `service` is currently registered.
    pub fn has_service(&self, service: &Arc<dyn Service>) -> bool {
        self.services.contains_key(&service_key(service))
    }
}

impl Service for Context {
    fn start(&self) -> Result<()> {
        self.config.validate()?;
        self.status
            .start_with(|| {
                debug!(context = %self.name, "Context started");
                Ok(())
            })
            .map(|_| ())
    }

    /// Stops every registered service and clears the registry.
    fn stop(&self) -> Result<()> {
        self.status
            .stop_with(|| {
                let services: Vec<Arc<dyn Service>> = self
                    .services
                    .iter()
                    .map(|r| Arc::clone(&r.service))
                    .collect();
                self.services.clear();
                for service in services {
                    if let Err(e) = service.stop() {
                        warn!(context = %self.name, service = %service.name(), error = %e, "Error stopping service");
                    }
                }
                debug!(context = %self.name, "Context stopped");
                Ok(())
            })
            .map(|_| ())
    }

    fn status(&self) -> ServiceStatus {
        self.status.status()
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl LifecycleAuthority for Context {
    fn add_service(&self, service: Arc<dyn Service>, autostart: bool, enlist: bool) -> Result<()> {
        if self.status.status() == ServiceStatus::Stopping {
            return Err(Error::rejected(format!("context '{}' is stopping", self.name)));
        }
        let key = service_key(&service);
        self.services.insert(
            key,
            Registration {
                service: Arc::clone(&service),
                managed: enlist,
            },
        );
        if autostart && let Err(e) = service.start() {
            self.services.remove(&key);
            return Err(e);
        }
        Ok(())
    }

    fn remove_service(&self, service: &Arc<dyn Service>) -> Result<bool> {
        Ok(self.services.remove(&service_key(service)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockService;

    #[test]
    fn add_service_autostarts_and_tracks() {
        let ctx = Context::started("ctx");
        let service: Arc<dyn Service> = Arc::new(MockService::default());
        ctx.add_service(Arc::clone(&service), true, true).unwrap();
        assert!(service.is_started());
        assert!(ctx.has_service(&service));
        assert_eq!(ctx.managed_count(), 1);

        assert!(ctx.remove_service(&service).unwrap());
        assert!(!ctx.remove_service(&service).unwrap());
        assert_eq!(ctx.service_count(), 0);
    }

    #[test]
    fn stopping_context_stops_services() {
        let ctx = Context::started("ctx");
        let service: Arc<dyn Service> = Arc::new(MockService::default());
        ctx.add_service(Arc::clone(&service), true, false).unwrap();
        ctx.stop().unwrap();
        assert!(ctx.is_stopped());
        assert!(service.is_stopped());
        assert_eq!(ctx.service_count(), 0);
        // second stop is a no-op
        ctx.stop().unwrap();
    }

    #[test]
    fn failed_autostart_is_not_registered() {
        let ctx = Context::started("ctx");
        let service: Arc<dyn Service> = Arc::new(MockService::failing_start());
        assert!(ctx.add_service(Arc::clone(&service), true, true).is_err());
        assert!(!ctx.has_service(&service));
    }
}
