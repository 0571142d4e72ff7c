//! Error types for the asynchronous dispatch path.
//!
//! Transient failures here feed the retry engine and are never surfaced to
//! synchronous callers; guard violations on manual operations use
//! `sluice_core::CoreError` instead. Queue-write failures after a status
//! update are the fatal class: logged, left for the reconciliation sweep,
//! never rolled back.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for dispatch and engine operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// Hard per-attempt timeout exceeded.
    #[error("request timeout after {timeout:?}")]
    Timeout {
        /// The timeout that was exceeded.
        timeout: Duration,
    },

    /// HTTP 4xx response from the endpoint.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code.
        status_code: u16,
    },

    /// HTTP 5xx response from the endpoint.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code.
        status_code: u16,
    },

    /// Endpoint rate limit would be exceeded; dispatch deferred.
    #[error("rate limited: retry after {retry_after:?}")]
    RateLimited {
        /// Time until the next token is available.
        retry_after: Duration,
    },

    /// Queue write failed after a status update was already applied.
    #[error("queue write failed: {message}")]
    Queue {
        /// Queue error message.
        message: String,
    },

    /// Storage operation failed during delivery.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message.
        message: String,
    },

    /// Invalid endpoint or client configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration error message.
        message: String,
    },

    /// Tenant transform failed or exceeded its execution budget.
    #[error("transform failed: {message}")]
    Transform {
        /// Transform error message.
        message: String,
    },

    /// Graceful shutdown exceeded its deadline.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The shutdown deadline.
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates a client error from an HTTP status.
    pub fn client_error(status_code: u16) -> Self {
        Self::ClientError { status_code }
    }

    /// Creates a server error from an HTTP status.
    pub fn server_error(status_code: u16) -> Self {
        Self::ServerError { status_code }
    }

    /// Creates a queue-write error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a transform error.
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform { message: message.into() }
    }

    /// Whether this failure should feed the retry schedule.
    ///
    /// Network errors, timeouts, 5xx responses, and 429s are retryable.
    /// Client errors other than 429, configuration problems, and transform
    /// failures are not; they terminate the delivery on the spot.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::Storage { .. } => true,

            Self::ClientError { status_code } => *status_code == 429,

            Self::Queue { .. }
            | Self::Configuration { .. }
            | Self::Transform { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(30)).is_retryable());
        assert!(DeliveryError::server_error(503).is_retryable());
        assert!(DeliveryError::client_error(429).is_retryable());

        assert!(!DeliveryError::client_error(404).is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
        assert!(!DeliveryError::transform("script timed out").is_retryable());
        assert!(!DeliveryError::queue("broker unavailable").is_retryable());
    }

    #[test]
    fn error_display_format() {
        let error = DeliveryError::server_error(500);
        assert_eq!(error.to_string(), "server error: HTTP 500");

        let error = DeliveryError::client_error(410);
        assert_eq!(error.to_string(), "client error: HTTP 410");
    }
}
