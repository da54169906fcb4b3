//! Error types and handling for the gateway.
//!
//! Two layers: [`BackendError`] describes one failed backend invocation and
//! carries its transient/permanent classification; [`GatewayError`] is what a
//! caller of the gateway sees.

use crate::attempt::AttemptLog;
use crate::types::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using `GatewayError`
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Whether a failed invocation is worth retrying on the same backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// May succeed if retried after a delay
    Transient,
    /// Will fail again with the same input on this backend
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Finer-grained cause of a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The attempt exceeded its time budget
    Timeout,
    /// Connection refused, reset or otherwise broken
    Connection,
    /// Upstream 5xx
    ServerError,
    /// Upstream reported its own rate limit (429)
    ProviderRateLimit,
    /// Response body could not be interpreted
    MalformedResponse,
    /// Upstream rejected the request as malformed
    InvalidRequest,
    /// Credential missing, invalid or not authorized
    Authentication,
    /// Upstream refused the content
    ContentPolicy,
    /// No client is registered for the descriptor's provider
    UnknownProvider,
    /// Anything else
    Other,
}

impl ErrorClass {
    /// Classification applied when the class alone is known
    #[must_use]
    pub fn default_kind(self) -> FailureKind {
        match self {
            Self::Timeout
            | Self::Connection
            | Self::ServerError
            | Self::ProviderRateLimit
            | Self::MalformedResponse => FailureKind::Transient,
            Self::InvalidRequest
            | Self::Authentication
            | Self::ContentPolicy
            | Self::UnknownProvider
            | Self::Other => FailureKind::Permanent,
        }
    }

    /// Stable label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::ServerError => "server_error",
            Self::ProviderRateLimit => "provider_rate_limit",
            Self::MalformedResponse => "malformed_response",
            Self::InvalidRequest => "invalid_request",
            Self::Authentication => "authentication",
            Self::ContentPolicy => "content_policy",
            Self::UnknownProvider => "unknown_provider",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single backend invocation
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} {class} error: {message}")]
pub struct BackendError {
    /// Retry classification
    pub kind: FailureKind,
    /// Cause
    pub class: ErrorClass,
    /// Human-readable detail
    pub message: String,
    /// HTTP status reported by the backend, if any
    pub status: Option<u16>,
    /// Wait suggested by the backend, if any
    pub retry_after: Option<Duration>,
}

impl BackendError {
    /// Create an error using the class's default classification
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            kind: class.default_kind(),
            class,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Create a transient error
    #[must_use]
    pub fn transient(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            ..Self::new(class, message)
        }
    }

    /// Create a permanent error
    #[must_use]
    pub fn permanent(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            ..Self::new(class, message)
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::new(ErrorClass::Timeout, format!("attempt timed out after {duration:?}"))
    }

    /// Classify an upstream HTTP status
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        let class = match status {
            408 => ErrorClass::Timeout,
            429 => ErrorClass::ProviderRateLimit,
            401 | 403 => ErrorClass::Authentication,
            400 | 422 if looks_like_content_policy(&message) => ErrorClass::ContentPolicy,
            400 | 404 | 405 | 413 | 415 | 422 => ErrorClass::InvalidRequest,
            500..=599 => ErrorClass::ServerError,
            _ => ErrorClass::Other,
        };
        Self {
            status: Some(status),
            retry_after,
            ..Self::new(class, message)
        }
    }

    /// Attach a suggested retry delay
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Whether the same backend may be retried
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

fn looks_like_content_policy(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("content_policy") || lower.contains("content_filter") || lower.contains("safety")
}

/// Error returned to gateway callers
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Catalog or configuration is invalid
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Logical model is not in the active catalog
    #[error("Unknown model: {model}")]
    UnknownModel {
        /// Model that was requested
        model: String,
    },

    /// Request cannot be served as given
    #[error("Request rejected: {message}")]
    RequestRejected {
        /// Error message
        message: String,
        /// Offending field, if one is identifiable
        field: Option<String>,
    },

    /// A single backend failed transiently
    #[error("Transient backend error from {backend}: {source}")]
    TransientBackend {
        /// Backend that failed
        backend: String,
        /// Underlying failure
        source: BackendError,
    },

    /// A single backend failed permanently
    #[error("Permanent backend error from {backend}: {source}")]
    PermanentBackend {
        /// Backend that failed
        backend: String,
        /// Underlying failure
        source: BackendError,
    },

    /// Every candidate in the route failed
    #[error("All backends exhausted for model {model}: {attempts}")]
    AllBackendsExhausted {
        /// Logical model
        model: String,
        /// Every attempt made, in order
        attempts: AttemptLog,
    },

    /// Every candidate was denied by its rate budget
    #[error("Rate limited for model {model}")]
    RateLimited {
        /// Logical model
        model: String,
        /// Earliest moment a retry could be admitted
        retry_after: Option<Duration>,
        /// Every attempt made, in order
        attempts: AttemptLog,
    },

    /// The caller's deadline passed before a backend succeeded
    #[error("Deadline exceeded for model {model}: {attempts}")]
    DeadlineExceeded {
        /// Logical model
        model: String,
        /// Attempts made before the deadline
        attempts: AttemptLog,
    },

    /// The caller cancelled the call
    #[error("Call cancelled for model {model}")]
    Cancelled {
        /// Logical model
        model: String,
        /// Attempts made before cancellation
        attempts: AttemptLog,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl GatewayError {
    /// Check if the caller may retry the whole call later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientBackend { .. } | Self::RateLimited { .. } | Self::AllBackendsExhausted { .. }
        )
    }

    /// Get the error type string
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Config { .. } | Self::Internal { .. } => "internal_error",
            Self::UnknownModel { .. } => "not_found_error",
            Self::RequestRejected { .. } => "invalid_request_error",
            Self::TransientBackend { .. }
            | Self::PermanentBackend { .. }
            | Self::AllBackendsExhausted { .. } => "backend_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::DeadlineExceeded { .. } => "timeout_error",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Get the error code for programmatic handling
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_error",
            Self::UnknownModel { .. } => "unknown_model",
            Self::RequestRejected { .. } => "request_rejected",
            Self::TransientBackend { .. } => "transient_backend_error",
            Self::PermanentBackend { .. } => "permanent_backend_error",
            Self::AllBackendsExhausted { .. } => "all_backends_exhausted",
            Self::RateLimited { .. } => "rate_limited",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Attempt log attached to a terminal executor failure
    #[must_use]
    pub fn attempts(&self) -> Option<&AttemptLog> {
        match self {
            Self::AllBackendsExhausted { attempts, .. }
            | Self::RateLimited { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. }
            | Self::Cancelled { attempts, .. } => Some(attempts),
            _ => None,
        }
    }

    /// Suggested wait before retrying, when known
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::TransientBackend { source, .. } => source.retry_after,
            _ => None,
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an unknown model error
    #[must_use]
    pub fn unknown_model(model: impl Into<String>) -> Self {
        Self::UnknownModel {
            model: model.into(),
        }
    }

    /// Create a request rejected error
    #[must_use]
    pub fn rejected(message: impl Into<String>, field: Option<String>) -> Self {
        Self::RequestRejected {
            message: message.into(),
            field,
        }
    }

    /// Wrap a single backend failure according to its classification
    #[must_use]
    pub fn backend(backend: impl Into<String>, source: BackendError) -> Self {
        let backend = backend.into();
        match source.kind {
            FailureKind::Transient => Self::TransientBackend { backend, source },
            FailureKind::Permanent => Self::PermanentBackend { backend, source },
        }
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<ValidationError> for GatewayError {
    fn from(err: ValidationError) -> Self {
        Self::RequestRejected {
            field: Some(err.field().to_string()),
            message: err.to_string(),
        }
    }
}
