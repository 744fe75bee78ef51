//! Core error types for Spillway.

use thiserror::Error;

/// Result type alias using `SpillwayError`.
pub type SpillwayResult<T> = std::result::Result<T, SpillwayError>;

/// Kind of retry requested by the device allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryKind {
    /// Roll back and run the same work again, unchanged.
    Retry,
    /// Roll back; the work may only be retried on a smaller input.
    SplitAndRetry,
}

/// Core error type for Spillway operations.
///
/// `RetryOom` and `SplitAndRetryOom` are the two allocator signals the retry
/// executors react to. Every other variant is fatal.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpillwayError {
    /// The allocator rolled this thread back; the work can run again as-is.
    #[error("RetryOOM: {0}")]
    RetryOom(String),

    /// The allocator rolled this thread back; the input must shrink first.
    #[error("SplitAndRetryOOM: {0}")]
    SplitAndRetryOom(String),

    /// Device memory is exhausted and nothing else can be done about it.
    #[error("OutOfMemory: {0}")]
    OutOfMemory(String),

    /// Work execution error.
    #[error("ExecutionError: {0}")]
    ExecutionError(String),

    /// Spill storage error.
    #[error("SpillError: {0}")]
    SpillError(String),

    /// Internal error (bug in Spillway).
    #[error("InternalError: {0}")]
    InternalError(String),

    /// Invalid parameter provided.
    #[error("InvalidParameter: {0}")]
    InvalidParameter(String),
}

impl SpillwayError {
    /// Create a new `RetryOom` signal.
    pub fn retry_oom<S: Into<String>>(msg: S) -> Self {
        Self::RetryOom(msg.into())
    }

    /// Create a new `SplitAndRetryOom` signal.
    pub fn split_and_retry_oom<S: Into<String>>(msg: S) -> Self {
        Self::SplitAndRetryOom(msg.into())
    }

    /// Create a new `OutOfMemory` error.
    pub fn out_of_memory<S: Into<String>>(msg: S) -> Self {
        Self::OutOfMemory(msg.into())
    }

    /// Create a new `InternalError`.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::InternalError(msg.into())
    }

    /// Create a new `ExecutionError`.
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::ExecutionError(msg.into())
    }

    /// Create a new `SpillError`.
    pub fn spill<S: Into<String>>(msg: S) -> Self {
        Self::SpillError(msg.into())
    }

    /// Create a new `InvalidParameter` error.
    pub fn invalid_parameter<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create a cancellation error (using `ExecutionError`).
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::ExecutionError(format!("Cancelled: {}", msg.into()))
    }

    /// The retry signal carried by this error, if any.
    pub fn retry_kind(&self) -> Option<RetryKind> {
        match self {
            Self::RetryOom(_) => Some(RetryKind::Retry),
            Self::SplitAndRetryOom(_) => Some(RetryKind::SplitAndRetry),
            _ => None,
        }
    }

    /// Whether this error is one of the two allocator retry signals.
    pub fn is_retryable(&self) -> bool {
        self.retry_kind().is_some()
    }

    /// Turn a retry signal that nobody can act on into a plain `OutOfMemory`.
    ///
    /// Fatal errors are returned unchanged.
    pub fn into_fatal(self) -> Self {
        match self {
            Self::RetryOom(msg) | Self::SplitAndRetryOom(msg) => Self::OutOfMemory(msg),
            other => other,
        }
    }
}
