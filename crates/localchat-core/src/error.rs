use thiserror::Error;

use crate::repositories::RepositoryError;
use crate::services::InferenceError;

/// Failures of a single engine operation. Nothing here is fatal to the
/// process: every error is scoped to the intent that triggered it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Rejected before any side effect (empty input, unknown id, busy turn).
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] RepositoryError),

    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    /// User initiated pause. A normal terminal state, never shown as a failure.
    #[error("Request cancelled")]
    Cancelled,
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation(message.into())
    }

    /// Cloneable projection published to subscribers as `last_error`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(message) => ErrorKind::Validation(message.clone()),
            SyncError::Persistence(e) => ErrorKind::Persistence(e.to_string()),
            SyncError::Inference(e) => ErrorKind::Inference {
                failure: e.failure(),
                message: e.to_string(),
            },
            SyncError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Which part of the model call went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferenceFailure {
    Configuration,
    Request,
    Malformed,
    Timeout,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ErrorKind {
    Validation(String),
    Persistence(String),
    Inference {
        failure: InferenceFailure,
        message: String,
    },
    Cancelled,
}

impl ErrorKind {
    pub fn message(&self) -> &str {
        match self {
            ErrorKind::Validation(message) | ErrorKind::Persistence(message) => message,
            ErrorKind::Inference { message, .. } => message,
            ErrorKind::Cancelled => "Request cancelled",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ErrorKind::Inference {
                failure: InferenceFailure::Timeout,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_kind_is_distinct_from_cancellation() {
        let err = SyncError::from(InferenceError::Timeout(Duration::from_secs(30)));
        let kind = err.kind();
        assert!(kind.is_timeout());
        assert_ne!(kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_persistence_kind_keeps_message() {
        let err = SyncError::from(RepositoryError::InvalidData {
            message: "row missing".to_string(),
        });
        assert!(matches!(err.kind(), ErrorKind::Persistence(ref m) if m.contains("row missing")));
    }
}
