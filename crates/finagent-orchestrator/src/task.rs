//! Task definitions, per-task state machine and task results

use finagent_core::{CancelReason, Capability};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Identifier of a task within one request's graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a task id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<Capability> for TaskId {
    fn from(capability: Capability) -> Self {
        Self::new(capability.as_str())
    }
}

/// Why a task did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The agent did not answer within the task timeout
    Timeout,
    /// Completion status of the call is unknown
    AmbiguousOutcome,
    /// The request was cancelled by the caller
    Cancelled,
    /// The request's overall deadline elapsed
    DeadlineExceeded,
    /// The agent reported a definite failure
    AgentFailed(String),
    /// A task this one depends on was abandoned
    DependencyAbandoned(TaskId),
}

impl FailureReason {
    /// Whether the engine may retry automatically
    ///
    /// Ambiguous outcomes are only retried blindly for idempotent agents.
    pub fn is_retryable(&self, idempotent: bool) -> bool {
        match self {
            Self::Timeout | Self::AgentFailed(_) => true,
            Self::AmbiguousOutcome => idempotent,
            Self::Cancelled | Self::DeadlineExceeded | Self::DependencyAbandoned(_) => false,
        }
    }

    /// Whether another agent may take over the task after this failure
    pub fn allows_failover(&self) -> bool {
        matches!(self, Self::Timeout | Self::AgentFailed(_))
    }
}

impl From<CancelReason> for FailureReason {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => Self::Cancelled,
            CancelReason::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("Timeout"),
            Self::AmbiguousOutcome => f.write_str("AmbiguousOutcome"),
            Self::Cancelled => f.write_str("Cancelled"),
            Self::DeadlineExceeded => f.write_str("DeadlineExceeded"),
            Self::AgentFailed(msg) => write!(f, "AgentFailed: {msg}"),
            Self::DependencyAbandoned(id) => write!(f, "DependencyAbandoned: {id}"),
        }
    }
}

/// One unit of work in a task graph
///
/// Created by the router; immutable afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSpec {
    id: TaskId,
    capability: Capability,
    input: Value,
    dependencies: Vec<TaskId>,
    max_retries: u32,
    timeout: Duration,
}

impl TaskSpec {
    pub(crate) fn new(id: impl Into<TaskId>, capability: Capability, input: Value) -> Self {
        Self {
            id: id.into(),
            capability,
            input,
            dependencies: Vec::new(),
            max_retries: 0,
            timeout: Duration::from_secs(30),
        }
    }

    pub(crate) fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub(crate) fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Ordered dependency ids
    pub fn dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Hard upper bound on attempts per agent
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Status reported in a [`TaskResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    /// Succeeded after at least one self-critique revision
    Revised,
    Abandoned,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Revised)
    }
}

/// Engine-side state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Abandoned,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Abandoned)
    }

    /// Legal edges of the per-task state machine
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::{Abandoned, Failed, Pending, Ready, Retrying, Running, Succeeded};
        matches!(
            (self, next),
            (Pending, Ready | Abandoned)
                | (Ready, Running | Abandoned)
                | (Running, Succeeded | Failed | Retrying | Abandoned)
                | (Retrying, Running | Abandoned)
                | (Failed, Retrying | Abandoned)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Outcome of executing one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub capability: Capability,
    pub status: TaskStatus,
    /// Opaque agent output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Score of the finalized output, if self-critique ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique_score: Option<f64>,
    /// Total attempts across all agents that handled the task
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Name of the agent that produced this result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl TaskResult {
    pub fn succeeded(spec: &TaskSpec, output: Value, attempts: u32) -> Self {
        Self {
            task_id: spec.id().clone(),
            capability: spec.capability(),
            status: TaskStatus::Succeeded,
            output: Some(output),
            critique_score: None,
            attempts,
            reason: None,
            agent: None,
        }
    }

    pub fn failed(spec: &TaskSpec, reason: FailureReason, attempts: u32) -> Self {
        Self {
            task_id: spec.id().clone(),
            capability: spec.capability(),
            status: TaskStatus::Failed,
            output: None,
            critique_score: None,
            attempts,
            reason: Some(reason),
            agent: None,
        }
    }

    pub fn abandoned(spec: &TaskSpec, reason: FailureReason, attempts: u32) -> Self {
        Self {
            status: TaskStatus::Abandoned,
            ..Self::failed(spec, reason, attempts)
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_critique_score(mut self, score: Option<f64>) -> Self {
        self.critique_score = score;
        self
    }

    /// Mark a successful result as revised through self-critique
    pub fn revised(mut self) -> Self {
        if self.status == TaskStatus::Succeeded {
            self.status = TaskStatus::Revised;
        }
        self
    }

    /// Convert into an abandoned result, keeping the failure reason
    pub(crate) fn into_abandoned(mut self) -> Self {
        self.status = TaskStatus::Abandoned;
        self.output = None;
        self
    }
}
