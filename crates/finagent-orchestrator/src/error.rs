//! Error types for orchestration

use crate::task::{FailureReason, TaskId};
use finagent_core::Capability;
use std::time::Duration;
use thiserror::Error;

/// Orchestration errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    /// An exclusive capability already has an agent
    #[error("Capability already registered: {0}")]
    DuplicateCapability(Capability),

    /// No agent is registered for a capability
    #[error("No agent registered for capability: {0}")]
    UnresolvedCapability(Capability),

    /// A request needs a capability nobody provides
    #[error("Request cannot be routed: no agent provides {0}")]
    UnroutableRequest(Capability),

    /// The task graph contains a cycle
    #[error("Cyclic dependency: {0}")]
    CyclicDependency(String),

    /// A task depends on a task id that is not in the graph
    #[error("Task {task_id} depends on unknown task {missing}")]
    UnknownDependency { task_id: TaskId, missing: TaskId },

    /// Two tasks share an id
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// The request itself is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A task did not succeed, so no full analysis can be produced
    #[error("Incomplete analysis: task {task_id} ({capability}) failed: {reason}")]
    IncompleteAnalysis {
        task_id: TaskId,
        capability: Capability,
        reason: FailureReason,
    },

    /// Waiting for a request exceeded the caller's deadline
    #[error("Timed out after {0:?} waiting for request")]
    Timeout(Duration),

    /// The request has already been waited on
    #[error("Request {0} already completed")]
    AlreadyCompleted(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Whether the error was raised before any agent was invoked
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateCapability(_)
                | Self::UnresolvedCapability(_)
                | Self::UnroutableRequest(_)
                | Self::CyclicDependency(_)
                | Self::UnknownDependency { .. }
                | Self::DuplicateTask(_)
                | Self::InvalidRequest(_)
        )
    }
}

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<OrchestratorError> for finagent_core::Error {
    fn from(err: OrchestratorError) -> Self {
        finagent_core::Error::ProcessingFailed(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::ConfigError(err.to_string())
    }
}
