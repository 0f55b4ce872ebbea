//! Error types for the workorder layer

use crate::{InstanceId, ProcessId, StepId, UserId};

/// Errors that can occur across workorder operations
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Process definition invalid: {0}")]
    DefinitionInvalid(String),

    #[error("Process definition not found: {0}")]
    DefinitionNotFound(ProcessId),

    #[error("Workorder instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Step not active: {0}")]
    StepNotActive(StepId),

    #[error("Action '{action}' not allowed at step '{step}'")]
    ActionNotAllowed { step: StepId, action: String },

    #[error("Operator '{operator}' is not an assignee of step '{step}'")]
    UnauthorizedAction { step: StepId, operator: UserId },

    #[error("No candidates resolved for step: {0}")]
    Unassignable(StepId),

    #[error("Decision step '{0}' has no matching connection and no default edge")]
    ConditionAmbiguous(StepId),

    #[error("Concurrent modification of instance {0}; retry after inspecting state")]
    ConcurrentModification(InstanceId),

    #[error("Instance {0} is not running")]
    InstanceNotRunning(InstanceId),

    #[error("Instance {0} already reached a terminal status")]
    AlreadyTerminal(InstanceId),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl FlowError {
    /// Whether the caller may retry the operation after inspecting the
    /// returned state. Definition-level failures are fatal at publish
    /// time; action-application failures are retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FlowError::DefinitionInvalid(_) | FlowError::Validation(_)
        )
    }
}

/// Result type alias for workorder operations
pub type FlowResult<T> = Result<T, FlowError>;
