// ABOUTME: Error taxonomy for routing passes and the batch lifecycle API
// ABOUTME: Every error maps to a category that decides how the engine reacts

use thiserror::Error;

use crate::batch::BatchStatus;

/// How the engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retry the pass later; gap state is left untouched.
    Transient,
    /// Skip the offending rule, keep evaluating the others.
    Configuration,
    /// Route the row to nobody for the failing rule.
    Evaluation,
    /// Abort the channel and flag it for an operator.
    Fatal,
    /// Lost an optimistic update race; re-read and retry.
    Conflict,
    /// Caller supplied an invalid request.
    Usage,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("configuration error in {context}: {message}")]
    Configuration { context: String, message: String },

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("inconsistent state: {0}")]
    Fatal(String),

    #[error("concurrent modification of {0}")]
    Conflict(String),

    #[error("batch {node_id}-{batch_id} cannot move from {from} to {to}")]
    InvalidTransition {
        node_id: String,
        batch_id: i64,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("batch {node_id}-{batch_id} not found")]
    BatchNotFound { node_id: String, batch_id: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("change log error: {0:#}")]
    ChangeLog(#[from] anyhow::Error),
}

impl RouteError {
    pub fn config(context: impl Into<String>, message: impl Into<String>) -> Self {
        RouteError::Configuration {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RouteError::Transient(_) | RouteError::Storage(_) | RouteError::ChangeLog(_) => {
                ErrorCategory::Transient
            }
            RouteError::Configuration { .. } => ErrorCategory::Configuration,
            RouteError::Evaluation(_) => ErrorCategory::Evaluation,
            RouteError::Fatal(_) => ErrorCategory::Fatal,
            RouteError::Conflict(_) => ErrorCategory::Conflict,
            RouteError::InvalidTransition { .. } | RouteError::BatchNotFound { .. } => {
                ErrorCategory::Usage
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

pub type Result<T, E = RouteError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_transient() {
        let err: RouteError = rusqlite::Error::InvalidQuery.into();
        assert!(err.is_transient());
        let err: RouteError = anyhow::anyhow!("disk I/O").into();
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            RouteError::config("router r1", "missing KEY_COLUMN").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            RouteError::Fatal("overlap".into()).category(),
            ErrorCategory::Fatal
        );
        let err = RouteError::BatchNotFound {
            node_id: "store-1".into(),
            batch_id: 9,
        };
        assert_eq!(err.category(), ErrorCategory::Usage);
        assert_eq!(err.to_string(), "batch store-1-9 not found");
    }
}
