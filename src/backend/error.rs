//! Backend error type with retry classification.

/// Errors surfaced by [`super::Backend`] implementations.
///
/// Contract errors (`AlreadyExists`, `NotFound`, `LostLease`) are part of the
/// backend protocol and never retried. `Storage` wraps transport and engine
/// failures; the dispatch layer retries those marked retryable with backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    AlreadyExists,
    NotFound(String),
    LostLease,
    Storage {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl BackendError {
    /// Transient storage failure worth retrying.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Permanent storage failure.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        BackendError::Storage {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::AlreadyExists => write!(f, "workflow instance already exists"),
            BackendError::NotFound(what) => write!(f, "not found: {what}"),
            BackendError::LostLease => write!(f, "task lease lost"),
            BackendError::Storage {
                operation, message, ..
            } => write!(f, "{operation}: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}
