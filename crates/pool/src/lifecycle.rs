//! Service lifecycle: status, the `Service` trait and its state machine.
//!
//! Every pooled resource (producer or polling consumer) and every cache in
//! this crate is a [`Service`]. [`ServiceSupport`] holds the status in an
//! atomic so that `start`/`stop` are idempotent and safe to call from any
//! thread: only the caller that wins the transition runs the work.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, warn};

use crate::context::LifecycleAuthority;
use crate::error::Result;

/// Lifecycle status of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    /// Constructed, never started.
    Created,
    /// Start in progress (possibly asynchronous).
    Starting,
    /// Running.
    Started,
    /// Stop in progress.
    Stopping,
    /// Stopped; may be started again.
    Stopped,
}

impl ServiceStatus {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Starting => 1,
            Self::Started => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Started => write!(f, "started"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A stateful, lifecycle-managed object.
///
/// Implementations must make `start` and `stop` idempotent; embedding a
/// [`ServiceSupport`] gives that for free.
pub trait Service: Send + Sync {
    /// Start the service.
    fn start(&self) -> Result<()>;

    /// Stop the service.
    fn stop(&self) -> Result<()>;

    /// Current lifecycle status.
    fn status(&self) -> ServiceStatus;

    /// Short name used in logs.
    fn name(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }

    /// Whether the service is fully started.
    fn is_started(&self) -> bool {
        self.status() == ServiceStatus::Started
    }

    /// Whether a start is still in progress.
    fn is_starting(&self) -> bool {
        self.status() == ServiceStatus::Starting
    }

    /// Whether the service is stopped (or stopping).
    fn is_stopped(&self) -> bool {
        matches!(
            self.status(),
            ServiceStatus::Stopped | ServiceStatus::Stopping
        )
    }
}

/// Atomic lifecycle state machine embedded by service implementations.
#[derive(Debug)]
pub struct ServiceSupport {
    status: AtomicU8,
}

impl Default for ServiceSupport {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceSupport {
    /// New state machine in [`ServiceStatus::Created`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: AtomicU8::new(ServiceStatus::Created.as_u8()),
        }
    }

    /// Current status.
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Force the status; used by services that finish starting asynchronously.
    pub fn set_status(&self, status: ServiceStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: ServiceStatus, to: ServiceStatus) -> bool {
        self.status
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run `do_start` if the service is created or stopped.
    ///
    /// Returns `Ok(false)` when another caller already started (or is
    /// starting) the service. On failure the status falls back to stopped.
    pub fn start_with(&self, do_start: impl FnOnce() -> Result<()>) -> Result<bool> {
        if !self.transition(ServiceStatus::Created, ServiceStatus::Starting)
            && !self.transition(ServiceStatus::Stopped, ServiceStatus::Starting)
        {
            return Ok(false);
        }
        match do_start() {
            Ok(()) => {
                self.set_status(ServiceStatus::Started);
                Ok(true)
            }
            Err(e) => {
                self.set_status(ServiceStatus::Stopped);
                Err(e)
            }
        }
    }

    /// Begin a start that completes later via [`ServiceSupport::set_status`].
    ///
    /// Returns `false` if the service was not in a startable state.
    pub fn begin_start(&self) -> bool {
        self.transition(ServiceStatus::Created, ServiceStatus::Starting)
            || self.transition(ServiceStatus::Stopped, ServiceStatus::Starting)
    }

    /// Run `do_stop` if the service is started or starting.
    ///
    /// Returns `Ok(false)` when there was nothing to stop, which makes
    /// repeated stops free of side effects.
    pub fn stop_with(&self, do_stop: impl FnOnce() -> Result<()>) -> Result<bool> {
        if !self.transition(ServiceStatus::Started, ServiceStatus::Stopping)
            && !self.transition(ServiceStatus::Starting, ServiceStatus::Stopping)
        {
            return Ok(false);
        }
        let result = do_stop();
        self.set_status(ServiceStatus::Stopped);
        result.map(|()| true)
    }
}

/// Stable identity of a shared service, used as a map key.
pub(crate) fn service_key<S: ?Sized>(service: &Arc<S>) -> usize {
    Arc::as_ptr(service).cast::<()>() as usize
}

/// Stop `service` and deregister it from `authority`.
///
/// Both steps always run. A stop failure is logged at warn, a deregistration
/// failure at debug; neither is propagated.
pub fn stop_and_deregister(service: Arc<dyn Service>, authority: &dyn LifecycleAuthority) {
    if let Err(e) = service.stop() {
        warn!(service = %service.name(), error = %e, "Error stopping service");
    }
    if let Err(e) = authority.remove_service(&service) {
        debug!(
            service = %service.name(),
            error = %e,
            "Error removing service from lifecycle authority"
        );
    }
}
