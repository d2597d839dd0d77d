//! Error taxonomy shared across the workspace.
//!
//! Every subsystem maps its failures into this enum so that retry policy,
//! user-facing messages, and audit logging can be decided from the kind
//! alone. Transient IO errors are recovered close to where they happen;
//! everything else propagates with a correlation id attached by the caller
//! that first surfaces it.

use thiserror::Error;

/// Result type alias using the shared [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The last error observed from a single provider during fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttempt {
    /// Provider name (e.g. "together", "openai").
    pub provider: String,
    /// Stringified terminal error from that provider.
    pub error: String,
}

/// Workspace-wide error type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input. Surfaced to the caller, never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing or invalid credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed. Audited, never retried.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// An external call exceeded its deadline.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Transport-level failure talking to a backing service.
    #[error("connection error: {0}")]
    Connection(String),

    /// A bounded resource refused the request. Callers shed load.
    #[error("saturated: {0}")]
    Saturation(String),

    /// Provider asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// No provider passes the current eligibility filters.
    #[error("no eligible provider: {0}")]
    ProviderUnavailable(String),

    /// Every eligible provider returned a terminal error.
    #[error("all providers exhausted ({} attempted)", attempts.len())]
    ExhaustedProviders { attempts: Vec<ProviderAttempt> },

    /// An invariant the system depends on was violated. Never retried.
    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    /// The surrounding scope was cancelled. Not an error to the user.
    #[error("cancelled")]
    Cancelled,

    /// Anything else. Internal detail, never shown to clients.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden(msg.into())
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Error::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    pub fn saturation(msg: impl Into<String>) -> Self {
        Error::Saturation(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Error::RateLimited(msg.into())
    }

    pub fn provider_unavailable(msg: impl Into<String>) -> Self {
        Error::ProviderUnavailable(msg.into())
    }

    pub fn data_integrity(msg: impl Into<String>) -> Self {
        Error::DataIntegrity(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether a retry of the same operation could plausibly succeed.
    ///
    /// Components apply their own budgets on top of this; a `true` here only
    /// means the failure is transient in nature.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Connection(_) | Error::RateLimited(_)
        )
    }

    /// Stable machine-readable code for wire frames and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::Timeout { .. } => "timeout",
            Error::Connection(_) => "connection",
            Error::Saturation(_) => "saturation",
            Error::RateLimited(_) => "rate_limited",
            Error::ProviderUnavailable(_) => "provider_unavailable",
            Error::ExhaustedProviders { .. } => "exhausted_providers",
            Error::DataIntegrity(_) => "data_integrity",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Redacted message suitable for sending to a client.
    ///
    /// Internal details (backend addresses, raw provider bodies, stack
    /// context) must never leave the process; only validation and
    /// authorization errors carry their own text outward.
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation(msg) => msg.clone(),
            Error::Unauthorized(_) => "authentication required".to_string(),
            Error::Forbidden(_) => "you do not have access to this resource".to_string(),
            Error::Saturation(_) => "the service is busy, please retry shortly".to_string(),
            Error::Cancelled => "request cancelled".to_string(),
            Error::ProviderUnavailable(_) | Error::ExhaustedProviders { .. } => {
                "the assistant is temporarily unavailable, please retry shortly".to_string()
            }
            _ => "something went wrong processing your request".to_string(),
        }
    }
}

/// Generate a correlation id for error propagation across component
/// boundaries. Attached to structured logs and outbound error frames so a
/// client report can be joined back to server-side traces.
pub fn correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
