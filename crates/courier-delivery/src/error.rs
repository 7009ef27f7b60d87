//! Error types for webhook delivery operations.
//!
//! Variants fall into four groups: validation errors surfaced to the caller
//! before anything is queued, transient delivery errors handled by the retry
//! scheduler, and infrastructure errors from the queue, store or runtime.
//! A permanent failure is not an error of its own; it is the retry
//! scheduler giving up on a transient one.

use std::{fmt, time::Duration};

use courier_core::{models::DeliveryStatus, CoreError};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Destination failed the SSRF guard.
    #[error("unsafe target: {reason}")]
    UnsafeTarget {
        /// Why the target was rejected
        reason: String,
    },

    /// Subscription auth configuration is incomplete.
    #[error("invalid auth configuration: {message}")]
    InvalidAuth {
        /// What is missing
        message: String,
    },

    /// Subscription exists but is disabled.
    #[error("subscription {subscription_id} is inactive")]
    SubscriptionInactive {
        /// Subscription identifier
        subscription_id: String,
    },

    /// Subscription does not exist.
    #[error("subscription {subscription_id} not found")]
    SubscriptionNotFound {
        /// Subscription identifier
        subscription_id: String,
    },

    /// Delivery does not exist.
    #[error("delivery {delivery_id} not found")]
    DeliveryNotFound {
        /// Delivery identifier
        delivery_id: String,
    },

    /// Operation not allowed in the delivery's current status.
    #[error("delivery is {status}, operation requires a different status")]
    InvalidState {
        /// Status at the time of the request
        status: DeliveryStatus,
    },

    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request exceeded the subscription timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// HTTP response indicated client error (4xx or other non-2xx below 500).
    #[error("HTTP {status_code}: {body}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// HTTP response indicated server error (5xx).
    #[error("HTTP {status_code}: {body}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Receiver asked to slow down (429, or 503 with Retry-After).
    #[error("HTTP {status_code} rate limited: {body}")]
    RateLimited {
        /// HTTP status code
        status_code: u16,
        /// Retry-After value, if the receiver sent one
        retry_after_seconds: Option<u64>,
        /// Response body content
        body: String,
    },

    /// Queue operation failed.
    #[error("queue error: {message}")]
    QueueError {
        /// Queue error message
        message: String,
    },

    /// Database operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("configuration error: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Workers did not stop within the shutdown grace period.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Grace period that elapsed
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker index
        worker_id: usize,
        /// Join error description
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates an unsafe target error.
    pub fn unsafe_target(reason: impl Into<String>) -> Self {
        Self::UnsafeTarget { reason: reason.into() }
    }

    /// Creates an invalid auth error.
    pub fn invalid_auth(message: impl Into<String>) -> Self {
        Self::InvalidAuth { message: message.into() }
    }

    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with optional retry guidance.
    pub fn rate_limited(
        status_code: u16,
        retry_after_seconds: Option<u64>,
        body: impl Into<String>,
    ) -> Self {
        Self::RateLimited { status_code, retry_after_seconds, body: body.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::QueueError { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Maps a non-2xx response to its error.
    ///
    /// 429 is always a rate limit; 503 counts as one only when the receiver
    /// says when to come back.
    pub fn from_status(status_code: u16, body: impl Into<String>, retry_after: Option<u64>) -> Self {
        match status_code {
            429 => Self::rate_limited(status_code, retry_after, body),
            503 if retry_after.is_some() => Self::rate_limited(status_code, retry_after, body),
            500..=599 => Self::server_error(status_code, body),
            _ => Self::client_error(status_code, body),
        }
    }

    /// Whether the failure is transient and goes to the retry scheduler.
    ///
    /// Every outcome of a dispatched request is transient, including 4xx:
    /// receivers routinely return 404 or 401 while being redeployed.
    /// Validation errors are final, and infrastructure errors are recovered
    /// by the queue lease rather than by scheduling another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. }
                | Self::Timeout { .. }
                | Self::ClientError { .. }
                | Self::ServerError { .. }
                | Self::RateLimited { .. }
        )
    }

    /// Seconds the receiver asked us to wait, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds, .. } => *retry_after_seconds,
            _ => None,
        }
    }

    /// HTTP status of the response that caused the error, if one arrived.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. }
            | Self::ServerError { status_code, .. }
            | Self::RateLimited { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Response body of the failed request, if one arrived.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::ClientError { body, .. }
            | Self::ServerError { body, .. }
            | Self::RateLimited { body, .. } => Some(body),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Database(message) => Self::database(message),
            CoreError::InvalidTransition { from, .. } => Self::InvalidState { status: from },
            other => Self::internal(other.to_string()),
        }
    }
}

/// Category of delivery error for logging and API status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before dispatch; never retried.
    Validation,
    /// Connectivity or timeout.
    Network,
    /// Receiver returned a non-5xx error.
    Client,
    /// Receiver returned a 5xx.
    Server,
    /// Receiver throttled us.
    RateLimit,
    /// Queue, database or runtime failure.
    Infrastructure,
}

impl ErrorCategory {
    /// Whether errors of this category are retried by the scheduler.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Network | Self::Client | Self::Server | Self::RateLimit)
    }
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::UnsafeTarget { .. }
            | DeliveryError::InvalidAuth { .. }
            | DeliveryError::SubscriptionInactive { .. }
            | DeliveryError::SubscriptionNotFound { .. }
            | DeliveryError::DeliveryNotFound { .. }
            | DeliveryError::InvalidState { .. } => Self::Validation,
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::QueueError { .. }
            | DeliveryError::DatabaseError { .. }
            | DeliveryError::ConfigurationError { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Infrastructure,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(5)).is_retryable());
        assert!(DeliveryError::server_error(500, "internal server error").is_retryable());
        assert!(DeliveryError::client_error(404, "not found").is_retryable());
        assert!(DeliveryError::rate_limited(429, Some(60), "").is_retryable());

        assert!(!DeliveryError::unsafe_target("private address").is_retryable());
        assert!(!DeliveryError::invalid_auth("missing secret").is_retryable());
        assert!(!DeliveryError::database("connection lost").is_retryable());
        assert!(!DeliveryError::queue("broker down").is_retryable());
    }

    #[test]
    fn status_mapping_distinguishes_rate_limits() {
        assert!(matches!(
            DeliveryError::from_status(429, "slow down", None),
            DeliveryError::RateLimited { retry_after_seconds: None, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(503, "", Some(30)),
            DeliveryError::RateLimited { retry_after_seconds: Some(30), .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(503, "", None),
            DeliveryError::ServerError { status_code: 503, .. }
        ));
        assert!(matches!(
            DeliveryError::from_status(302, "", None),
            DeliveryError::ClientError { status_code: 302, .. }
        ));
    }

    #[test]
    fn response_details_exposed() {
        let error = DeliveryError::server_error(502, "bad gateway");
        assert_eq!(error.status_code(), Some(502));
        assert_eq!(error.response_body(), Some("bad gateway"));
        assert_eq!(error.to_string(), "HTTP 502: bad gateway");

        let timeout = DeliveryError::timeout(Duration::from_millis(1500));
        assert_eq!(timeout.status_code(), None);
        assert_eq!(timeout.to_string(), "request timeout after 1500ms");
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(ErrorCategory::from(&DeliveryError::network("test")), ErrorCategory::Network);
        assert_eq!(
            ErrorCategory::from(&DeliveryError::client_error(400, "bad request")),
            ErrorCategory::Client
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::unsafe_target("loopback")),
            ErrorCategory::Validation
        );
        assert_eq!(
            ErrorCategory::from(&DeliveryError::queue("down")),
            ErrorCategory::Infrastructure
        );
        assert!(ErrorCategory::RateLimit.is_transient());
        assert!(!ErrorCategory::Validation.is_transient());
    }

    #[test]
    fn core_errors_convert() {
        let err = DeliveryError::from(CoreError::InvalidTransition {
            from: DeliveryStatus::Delivered,
            to: DeliveryStatus::Processing,
        });
        assert!(matches!(err, DeliveryError::InvalidState { status: DeliveryStatus::Delivered }));

        let err = DeliveryError::from(CoreError::Database("pool timed out".to_string()));
        assert!(matches!(err, DeliveryError::DatabaseError { .. }));
    }
}
