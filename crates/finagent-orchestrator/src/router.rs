//! Task router
//!
//! Decomposes an [`AnalysisRequest`] into a validated [`TaskGraph`] and
//! assigns every task the agents a registry snapshot resolves for it.
//! Routing is pure: the same request and snapshot always yield the same plan.

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::graph::TaskGraph;
use crate::intent::IntentClassifier;
use crate::registry::{AgentDescriptor, RegistrySnapshot};
use crate::request::{AnalysisRequest, TaskSelection};
use crate::task::{TaskId, TaskSpec};
use finagent_core::Capability;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Upstream capabilities each capability consumes
pub fn canonical_dependencies(capability: Capability) -> &'static [Capability] {
    match capability {
        Capability::Ingest => &[],
        Capability::TechnicalAnalysis | Capability::FundamentalAnalysis => &[Capability::Ingest],
        Capability::RiskAssessment => &[
            Capability::TechnicalAnalysis,
            Capability::FundamentalAnalysis,
        ],
        Capability::Decision => &[Capability::RiskAssessment],
        Capability::Monitor => &[Capability::Decision],
    }
}

/// Routed request, ready for execution
#[derive(Debug, Clone)]
pub struct RoutePlan {
    pub request_id: String,
    pub tickers: Vec<String>,
    pub deadline: Duration,
    pub graph: TaskGraph,
    /// Agents per task in failover order
    pub assignments: HashMap<TaskId, Arc<[AgentDescriptor]>>,
}

/// Builds task graphs from requests
#[derive(Debug, Clone)]
pub struct TaskRouter {
    config: Arc<OrchestratorConfig>,
    classifier: IntentClassifier,
}

impl TaskRouter {
    pub fn new(config: Arc<OrchestratorConfig>) -> Self {
        Self {
            config,
            classifier: IntentClassifier::new(),
        }
    }

    /// Decompose a request into a task graph with agent assignments
    pub fn route(&self, request: &AnalysisRequest, snapshot: &RegistrySnapshot) -> Result<RoutePlan> {
        let tickers = request.normalized_tickers()?;

        let deadline = request.deadline.unwrap_or(self.config.request_deadline);
        if deadline.is_zero() {
            return Err(OrchestratorError::InvalidRequest(
                "deadline must be greater than 0".to_string(),
            ));
        }

        let kinds = self.selected_kinds(&request.selection)?;

        let mut assignments = HashMap::with_capacity(kinds.len());
        for &kind in &kinds {
            let agents = snapshot
                .resolve(kind)
                .map_err(|_| OrchestratorError::UnroutableRequest(kind))?;
            assignments.insert(TaskId::from(kind), agents);
        }

        let mut specs: Vec<TaskSpec> = kinds
            .iter()
            .map(|&kind| self.task_spec(kind, &kinds, request, &tickers))
            .collect();

        for dependency_override in &request.overrides {
            let Some(spec) = specs
                .iter_mut()
                .find(|spec| spec.id() == &dependency_override.task)
            else {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "dependency override targets unknown task {}",
                    dependency_override.task
                )));
            };
            *spec = spec
                .clone()
                .with_dependencies(dependency_override.depends_on.clone());
        }

        let graph = TaskGraph::from_specs(specs)?;
        debug!(
            request_id = %request.id,
            tasks = graph.len(),
            stages = graph.stages().len(),
            "Routed request"
        );

        Ok(RoutePlan {
            request_id: request.id.clone(),
            tickers,
            deadline,
            graph,
            assignments,
        })
    }

    /// Build a request from a free-text query
    pub fn request_from_query(&self, query: &str) -> Result<AnalysisRequest> {
        let tickers = self.classifier.extract_tickers(query);
        if tickers.is_empty() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "no ticker found in query: {query:?}"
            )));
        }

        let request = match self.classifier.classify(query) {
            TaskSelection::FullPipeline => AnalysisRequest::full_pipeline(tickers),
            TaskSelection::Kinds(kinds) => AnalysisRequest::for_kinds(kinds, tickers),
        };
        Ok(request.with_params(json!({ "query": query })))
    }

    /// Selected capabilities closed over their upstream dependencies
    fn selected_kinds(&self, selection: &TaskSelection) -> Result<BTreeSet<Capability>> {
        let requested: Vec<Capability> = match selection {
            TaskSelection::FullPipeline => Capability::ALL.to_vec(),
            TaskSelection::Kinds(kinds) if kinds.is_empty() => {
                return Err(OrchestratorError::InvalidRequest(
                    "no task kinds selected".to_string(),
                ));
            }
            TaskSelection::Kinds(kinds) => kinds.clone(),
        };

        let mut selected = BTreeSet::from([Capability::Ingest]);
        let mut pending = requested;
        while let Some(kind) = pending.pop() {
            if selected.insert(kind) {
                pending.extend(canonical_dependencies(kind));
            }
        }
        Ok(selected)
    }

    fn task_spec(
        &self,
        kind: Capability,
        selected: &BTreeSet<Capability>,
        request: &AnalysisRequest,
        tickers: &[String],
    ) -> TaskSpec {
        let dependencies = canonical_dependencies(kind)
            .iter()
            .filter(|dep| selected.contains(*dep))
            .map(|&dep| TaskId::from(dep))
            .collect();

        let input = json!({
            "request_id": request.id,
            "capability": kind,
            "tickers": tickers,
            "params": request.params,
        });

        TaskSpec::new(kind, kind, input)
            .with_dependencies(dependencies)
            .with_max_retries(self.config.max_retries_for(kind))
            .with_timeout(self.config.timeout_for(kind))
    }
}
