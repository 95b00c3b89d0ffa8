//! Caller-facing response

use crate::error::OrchestratorError;
use crate::task::{FailureReason, TaskId, TaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use finagent_core::Capability;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;

/// Overall status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Every task succeeded
    Succeeded,
    /// At least one task was abandoned after failing
    Failed,
    /// The caller cancelled the request
    Cancelled,
    /// The request deadline elapsed
    TimedOut,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Output of one task, keyed by capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSection {
    pub task_id: TaskId,
    pub capability: Capability,
    pub status: TaskStatus,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critique_score: Option<f64>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl TaskSection {
    pub(crate) fn from_result(result: &TaskResult) -> Self {
        Self {
            task_id: result.task_id.clone(),
            capability: result.capability,
            status: result.status,
            output: result.output.clone().unwrap_or(Value::Null),
            critique_score: result.critique_score,
            attempts: result.attempts,
            agent: result.agent.clone(),
        }
    }
}

/// First point of failure in dependency order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub task_id: TaskId,
    pub capability: Capability,
    pub reason: FailureReason,
}

impl FailureSummary {
    /// The `IncompleteAnalysis` error describing this failure
    pub fn to_error(&self) -> OrchestratorError {
        OrchestratorError::IncompleteAnalysis {
            task_id: self.task_id.clone(),
            capability: self.capability,
            reason: self.reason.clone(),
        }
    }
}

/// Merged result of a request
///
/// A failed response carries no sections: partial analyses are never
/// returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: String,
    pub status: RequestStatus,
    /// Task sections in topological order
    pub sections: Vec<TaskSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
    pub completed_at: DateTime<Utc>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Succeeded
    }

    /// Section produced for a capability
    pub fn section(&self, capability: Capability) -> Option<&TaskSection> {
        self.sections.iter().find(|s| s.capability == capability)
    }

    /// Output produced for a capability
    pub fn output(&self, capability: Capability) -> Option<&Value> {
        self.section(capability).map(|s| &s.output)
    }

    /// Capabilities in the order their sections appear
    pub fn capabilities(&self) -> Vec<Capability> {
        self.sections.iter().map(|s| s.capability).collect()
    }

    /// Human-readable summary, one line per task
    pub fn format_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Request {} {}", self.request_id, self.status.as_str());

        for section in &self.sections {
            let _ = write!(
                out,
                "  {:<22} {:<10} attempts={}",
                section.capability.as_str(),
                format!("{:?}", section.status).to_lowercase(),
                section.attempts
            );
            if let Some(score) = section.critique_score {
                let _ = write!(out, " score={score:.2}");
            }
            if let Some(agent) = &section.agent {
                let _ = write!(out, " agent={agent}");
            }
            out.push('\n');
        }

        if let Some(failure) = &self.failure {
            let _ = writeln!(out, "  {}", failure.to_error());
        }
        out
    }
}
