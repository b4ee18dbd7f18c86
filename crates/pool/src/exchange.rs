//! Message exchange passed through producers and consumers.
//!
//! An [`Exchange`] is a cheap, clonable handle onto shared mutable state, so a
//! producer completing asynchronously on another thread and the caller that
//! awaits the result observe the same body, headers and error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

/// Property holding the URI of the endpoint an exchange was last sent to.
pub const TO_ENDPOINT: &str = "to_endpoint";

/// Whether the sender expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    /// Fire and forget.
    #[default]
    InOnly,
    /// Request/reply.
    InOut,
}

#[derive(Debug, Default)]
struct State {
    body: Option<Value>,
    headers: HashMap<String, Value>,
    properties: HashMap<String, Value>,
    error: Option<Arc<Error>>,
}

#[derive(Debug)]
struct Inner {
    id: Uuid,
    pattern: ExchangePattern,
    created_at: DateTime<Utc>,
    state: Mutex<State>,
}

/// Shared handle to a message exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    inner: Arc<Inner>,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new(ExchangePattern::default())
    }
}

impl Exchange {
    /// Create an empty exchange with the given pattern.
    pub fn new(pattern: ExchangePattern) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                pattern,
                created_at: Utc::now(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Create an exchange carrying `body`.
    pub fn with_body(pattern: ExchangePattern, body: impl Into<Value>) -> Self {
        let exchange = Self::new(pattern);
        exchange.set_body(body);
        exchange
    }

    /// Unique id of the exchange.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Message exchange pattern.
    pub fn pattern(&self) -> ExchangePattern {
        self.inner.pattern
    }

    /// When the exchange was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Current body.
    pub fn body(&self) -> Option<Value> {
        self.inner.state.lock().body.clone()
    }

    /// Replace the body.
    pub fn set_body(&self, body: impl Into<Value>) {
        self.inner.state.lock().body = Some(body.into());
    }

    /// Remove and return the body.
    pub fn take_body(&self) -> Option<Value> {
        self.inner.state.lock().body.take()
    }

    /// Header value by name.
    pub fn header(&self, name: &str) -> Option<Value> {
        self.inner.state.lock().headers.get(name).cloned()
    }

    /// Set a header.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .state
            .lock()
            .headers
            .insert(name.into(), value.into());
    }

    /// Property value by name.
    pub fn property(&self, name: &str) -> Option<Value> {
        self.inner.state.lock().properties.get(name).cloned()
    }

    /// Set a property.
    pub fn set_property(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .state
            .lock()
            .properties
            .insert(name.into(), value.into());
    }

    /// Error recorded while processing, if any.
    pub fn error(&self) -> Option<Arc<Error>> {
        self.inner.state.lock().error.clone()
    }

    /// Whether processing recorded an error.
    pub fn is_failed(&self) -> bool {
        self.inner.state.lock().error.is_some()
    }

    /// Record a processing error, replacing any earlier one.
    pub fn set_error(&self, error: impl Into<Arc<Error>>) {
        self.inner.state.lock().error = Some(error.into());
    }

    /// Clear the recorded error.
    pub fn clear_error(&self) -> Option<Arc<Error>> {
        self.inner.state.lock().error.take()
    }

    /// Whether two handles refer to the same exchange.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
