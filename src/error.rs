//! Engine error taxonomy
//!
//! Definition errors surface synchronously to authoring callers and are never
//! retried. Storage failures bubble up as `Database` and are retried by the
//! job runner when they happen inside a step job.

use crate::execution::ExecutionStatus;

/// Errors produced by the definition store, execution store and engine facade
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow step not found: {0}")]
    StepNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// Manual trigger or start attempted on a deactivated workflow
    #[error("workflow is inactive: {0}")]
    WorkflowInactive(String),

    /// Reorder request whose id set differs from the workflow's step set
    #[error("invalid reorder: {0}")]
    InvalidReorder(String),

    /// Authoring-time validation failure (bad config, dangling branch, cycle, cron)
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid execution transition: {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Shorthand for authoring validation failures
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidDefinition(message.into())
    }

    /// True for errors the caller caused (as opposed to infrastructure failures)
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Database(_) | Self::Serialization(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(EngineError::WorkflowNotFound("wf".into()).is_client_error());
        assert!(EngineError::invalid("bad").is_client_error());
        assert!(!EngineError::Database(sqlx::Error::PoolClosed).is_client_error());
    }

    #[test]
    fn test_transition_message() {
        let err = EngineError::InvalidTransition {
            from: ExecutionStatus::Completed,
            to: ExecutionStatus::Running,
        };
        assert_eq!(err.to_string(), "invalid execution transition: completed -> running");
    }
}
