//! Error taxonomy for workflow code and the runtime.

use serde::{Deserialize, Serialize};

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Business or infrastructure error surfaced from user code.
    Error,
    /// The operation was withdrawn because its context was canceled.
    Canceled,
}

/// Failure shape persisted in history events (activity failures, sub-workflow
/// failures, failed workflow executions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetails {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Error,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: FailureKind::Canceled,
            message: "canceled".to_string(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == FailureKind::Canceled
    }
}

impl std::fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FailureKind::Error => write!(f, "{}", self.message),
            FailureKind::Canceled => write!(f, "canceled: {}", self.message),
        }
    }
}

/// Errors surfaced to workflow code, usually through a
/// [`crate::sync::Future`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// The awaited operation was withdrawn by cancellation, or the workflow's
    /// own context was canceled.
    Canceled,
    /// An activity exhausted its retries and surfaced an error.
    ActivityFailed { message: String },
    /// A sub-workflow execution finished with an error.
    SubWorkflowFailed { message: String },
    /// A payload could not be encoded or decoded.
    Serialization { message: String },
    /// Failure raised by workflow code itself.
    Application { message: String },
}

impl WorkflowError {
    pub fn application(message: impl Into<String>) -> Self {
        WorkflowError::Application {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        WorkflowError::Serialization {
            message: message.into(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, WorkflowError::Canceled)
    }

    /// The failure shape recorded in history for this error.
    pub(crate) fn to_failure_details(&self) -> FailureDetails {
        match self {
            WorkflowError::Canceled => FailureDetails::canceled(),
            other => FailureDetails::error(other.to_string()),
        }
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowError::Canceled => write!(f, "canceled"),
            WorkflowError::ActivityFailed { message } => write!(f, "activity failed: {message}"),
            WorkflowError::SubWorkflowFailed { message } => write!(f, "sub-workflow failed: {message}"),
            WorkflowError::Serialization { message } => write!(f, "serialization failed: {message}"),
            WorkflowError::Application { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<String> for WorkflowError {
    fn from(message: String) -> Self {
        WorkflowError::Application { message }
    }
}

impl From<&str> for WorkflowError {
    fn from(message: &str) -> Self {
        WorkflowError::Application {
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_maps_to_canceled_details() {
        let d = WorkflowError::Canceled.to_failure_details();
        assert!(d.is_canceled());
    }

    #[test]
    fn details_round_trip() {
        let d = FailureDetails::error("boom");
        let json = serde_json::to_string(&d).unwrap();
        let back: FailureDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }
}
