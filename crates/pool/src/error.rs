//! Error types for producer/consumer pooling
use thiserror::Error;

/// Result type for pooling operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed cause carried by error variants that wrap a lower-level failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for pooling, caching and send/receive operations
#[derive(Error, Debug)]
pub enum Error {
    /// A caller broke an API contract (e.g. zero cache capacity)
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the argument
        message: String,
    },

    /// Configuration is invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// The error message
        message: String,
    },

    /// The endpoint could not create or start a producer
    #[error("Failed to create producer for endpoint '{endpoint}': {source}")]
    FailedToCreateProducer {
        /// URI of the endpoint
        endpoint: String,
        /// The underlying error
        #[source]
        source: BoxError,
    },

    /// The endpoint could not create or start a polling consumer
    #[error("Failed to create consumer for endpoint '{endpoint}': {source}")]
    FailedToCreateConsumer {
        /// URI of the endpoint
        endpoint: String,
        /// The underlying error
        #[source]
        source: BoxError,
    },

    /// The context, cache or pool is not accepting work
    #[error("Rejected execution: {reason}")]
    RejectedExecution {
        /// Why the work was rejected
        reason: String,
    },

    /// A service failed to start or stop
    #[error("Lifecycle failure for service '{service}': {reason}")]
    Lifecycle {
        /// Name of the service
        service: String,
        /// The failure reason
        reason: String,
    },

    /// A producer or consumer failed while processing an exchange
    #[error("Processing failed on endpoint '{endpoint}': {message}")]
    Processing {
        /// URI of the endpoint
        endpoint: String,
        /// The error message
        message: String,
        /// The underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// An exchange completed with an error and the caller asked for it to be raised
    #[error("Exchange sent to '{endpoint}' failed: {source}")]
    Execution {
        /// URI of the endpoint
        endpoint: String,
        /// The error recorded on the exchange
        #[source]
        source: std::sync::Arc<Error>,
    },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal {
        /// The error message
        message: String,
    },
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wrap a creation failure for a producer
    pub fn failed_to_create_producer(endpoint: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::FailedToCreateProducer {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }

    /// Wrap a creation failure for a polling consumer
    pub fn failed_to_create_consumer(endpoint: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::FailedToCreateConsumer {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }

    /// Create a rejected-execution error
    pub fn rejected<S: Into<String>>(reason: S) -> Self {
        Self::RejectedExecution {
            reason: reason.into(),
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lifecycle {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create a processing error without an underlying cause
    pub fn processing(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processing {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if retrying the operation may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FailedToCreateProducer { .. }
            | Self::FailedToCreateConsumer { .. }
            | Self::RejectedExecution { .. } => true,
            Self::Execution { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Get the endpoint URI associated with this error (if any)
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::InvalidArgument { .. }
            | Self::Configuration { .. }
            | Self::RejectedExecution { .. }
            | Self::Lifecycle { .. }
            | Self::Internal { .. } => None,
            Self::FailedToCreateProducer { endpoint, .. }
            | Self::FailedToCreateConsumer { endpoint, .. }
            | Self::Processing { endpoint, .. }
            | Self::Execution { endpoint, .. } => Some(endpoint),
        }
    }
}
