//! Unified error types for the dispatcher.

use thiserror::Error;

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Unified error type for all relay crates.
///
/// Validation and admission errors are surfaced synchronously at submission
/// time; execution and timeout errors are retried per policy and only become
/// visible through the dead-letter path.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed submission, rejected synchronously and never enqueued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Function identifier not present in the registry.
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// A shard's store is unreachable; the submission fails closed.
    #[error("Queue store unavailable: {0}")]
    QueueUnavailable(String),

    /// The invoked function raised; retried per policy.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Watchdog expiry; treated like an execution failure for retries.
    #[error("Task timed out after {0} seconds")]
    Timeout(u64),

    /// Category admission quota exceeded.
    #[error("Rate limited for category '{category}', retry after {retry_after_ms}ms")]
    RateLimited {
        category: String,
        retry_after_ms: u64,
    },

    /// Circuit breaker open for a category; submissions fail fast.
    #[error("Circuit open for category '{0}'")]
    CircuitOpen(String),

    /// Lock acquire failed because another holder is active.
    #[error("Lock contention on '{key}': held by another holder")]
    LockContention { key: String },

    /// Resource not found.
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: &'static str, id: String },

    /// Operation conflicts with the current state (e.g. cancelling a
    /// terminal task, releasing with a stale fencing token).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DispatchError {
    /// Returns true if a failed execution with this error should be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Execution(_) | Self::Timeout(_) | Self::QueueUnavailable(_)
        )
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::UnknownFunction(_) => "UNKNOWN_FUNCTION",
            Self::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            Self::Execution(_) => "EXECUTION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::LockContention { .. } => "LOCK_CONTENTION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}
