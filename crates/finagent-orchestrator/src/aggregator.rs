//! Result aggregation
//!
//! Merges per-task results into the caller-facing [`Response`]. Either
//! every task contributes a section or the response reports the first
//! failure in dependency order and carries nothing else.

use crate::engine::RequestOutcome;
use crate::error::{OrchestratorError, Result};
use crate::graph::TaskGraph;
use crate::response::{FailureSummary, RequestStatus, Response, TaskSection};
use crate::task::{FailureReason, TaskId, TaskResult};
use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, warn};

/// Merges task results into a response
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAggregator;

impl ResultAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Merge results in topological order
    ///
    /// Fails with `IncompleteAnalysis` naming the first task, in
    /// topological order, that did not succeed or has no result.
    pub fn aggregate(
        &self,
        request_id: &str,
        graph: &TaskGraph,
        results: &HashMap<TaskId, TaskResult>,
    ) -> Result<Response> {
        let mut sections = Vec::with_capacity(graph.len());

        for spec in graph.topological_order() {
            let Some(result) = results.get(spec.id()) else {
                return Err(OrchestratorError::IncompleteAnalysis {
                    task_id: spec.id().clone(),
                    capability: spec.capability(),
                    reason: FailureReason::AgentFailed("no result recorded".into()),
                });
            };

            if !result.status.is_success() {
                return Err(OrchestratorError::IncompleteAnalysis {
                    task_id: spec.id().clone(),
                    capability: spec.capability(),
                    reason: result
                        .reason
                        .clone()
                        .unwrap_or_else(|| FailureReason::AgentFailed("unknown failure".into())),
                });
            }

            sections.push(TaskSection::from_result(result));
        }

        Ok(Response {
            request_id: request_id.to_string(),
            status: RequestStatus::Succeeded,
            sections,
            failure: None,
            completed_at: Utc::now(),
        })
    }

    /// Build the response for a finished request
    pub fn respond(&self, outcome: &RequestOutcome) -> Response {
        match self.aggregate(&outcome.request_id, &outcome.graph, &outcome.results) {
            Ok(response) => {
                info!(request_id = %outcome.request_id, sections = response.sections.len(), "Aggregated response");
                response
            }
            Err(OrchestratorError::IncompleteAnalysis {
                task_id,
                capability,
                reason,
            }) => {
                warn!(request_id = %outcome.request_id, %task_id, %reason, "Incomplete analysis");
                let status = match outcome.status {
                    RequestStatus::Succeeded => RequestStatus::Failed,
                    other => other,
                };
                Response {
                    request_id: outcome.request_id.clone(),
                    status,
                    sections: Vec::new(),
                    failure: Some(FailureSummary {
                        task_id,
                        capability,
                        reason,
                    }),
                    completed_at: Utc::now(),
                }
            }
            Err(other) => {
                warn!(request_id = %outcome.request_id, error = %other, "Aggregation failed");
                Response {
                    request_id: outcome.request_id.clone(),
                    status: RequestStatus::Failed,
                    sections: Vec::new(),
                    failure: None,
                    completed_at: Utc::now(),
                }
            }
        }
    }
}
