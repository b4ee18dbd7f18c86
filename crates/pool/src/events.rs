//! Exchange notifications emitted by producer caches.
//!
//! Provides [`PoolEvent`] and an [`EventBus`] backed by
//! `tokio::sync::broadcast`. Caches only emit when the owning context has
//! `event_notification` switched on.

use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Events emitted around a send through a producer cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// An exchange is about to be handed to a producer.
    ExchangeSending {
        /// URI of the target endpoint.
        endpoint: String,
        /// Id of the exchange.
        exchange_id: Uuid,
    },
    /// A producer finished with an exchange.
    ExchangeSent {
        /// URI of the target endpoint.
        endpoint: String,
        /// Id of the exchange.
        exchange_id: Uuid,
        /// Time spent inside the producer.
        elapsed: Duration,
    },
    /// A producer finished with an exchange that now carries an error.
    ExchangeFailed {
        /// URI of the target endpoint.
        endpoint: String,
        /// Id of the exchange.
        exchange_id: Uuid,
        /// Human-readable error description.
        error: String,
    },
}

impl PoolEvent {
    /// URI of the endpoint the event refers to.
    pub fn endpoint(&self) -> &str {
        match self {
            Self::ExchangeSending { endpoint, .. }
            | Self::ExchangeSent { endpoint, .. }
            | Self::ExchangeFailed { endpoint, .. } => endpoint,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus for exchange notifications.
///
/// Emission is fire-and-forget: if no subscribers are listening or the
/// channel is full, events are silently dropped.
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: PoolEvent) {
        // no active receivers
        let _ = self.sender.send(event);
    }

    /// Subscribe to events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.emit(PoolEvent::ExchangeSending {
            endpoint: "mock:a".to_string(),
            exchange_id: Uuid::new_v4(),
        });
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(PoolEvent::ExchangeFailed {
            endpoint: "mock:b".to_string(),
            exchange_id: Uuid::new_v4(),
            error: "connection refused".to_string(),
        });

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.endpoint(), "mock:b");
        assert_eq!(e1, e2);
    }
}
