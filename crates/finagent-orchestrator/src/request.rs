//! Caller-facing analysis request

use crate::error::{OrchestratorError, Result};
use crate::task::TaskId;
use finagent_core::Capability;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const MAX_TICKER_LEN: usize = 10;

/// Which kinds of work a request asks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSelection {
    /// Every capability from ingestion to monitoring
    FullPipeline,
    /// Only these capabilities plus whatever they depend on
    Kinds(Vec<Capability>),
}

/// Replace the dependency list of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyOverride {
    pub task: TaskId,
    pub depends_on: Vec<TaskId>,
}

impl DependencyOverride {
    pub fn new(task: impl Into<TaskId>, depends_on: impl IntoIterator<Item = TaskId>) -> Self {
        Self {
            task: task.into(),
            depends_on: depends_on.into_iter().collect(),
        }
    }
}

/// A request for analysis of one or more tickers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub id: String,
    pub selection: TaskSelection,
    pub tickers: Vec<String>,
    /// Overall deadline; the configured default applies when absent
    #[serde(
        default,
        rename = "deadlineMs",
        with = "crate::config::millis_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub deadline: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<DependencyOverride>,
    /// Free-form parameters forwarded to every agent
    #[serde(default)]
    pub params: Value,
}

impl AnalysisRequest {
    fn new(selection: TaskSelection, tickers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            selection,
            tickers: tickers.into_iter().map(Into::into).collect(),
            deadline: None,
            overrides: Vec::new(),
            params: Value::Null,
        }
    }

    /// Request the full pipeline
    pub fn full_pipeline(tickers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::new(TaskSelection::FullPipeline, tickers)
    }

    /// Request specific capabilities
    pub fn for_kinds(
        kinds: impl IntoIterator<Item = Capability>,
        tickers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self::new(TaskSelection::Kinds(kinds.into_iter().collect()), tickers)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_override(mut self, dependency_override: DependencyOverride) -> Self {
        self.overrides.push(dependency_override);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Trimmed, upper-cased, de-duplicated tickers
    ///
    /// Fails with `InvalidRequest` when no ticker is given or one contains
    /// characters other than letters, digits, `.` and `-`.
    pub fn normalized_tickers(&self) -> Result<Vec<String>> {
        let mut tickers: Vec<String> = Vec::with_capacity(self.tickers.len());
        for raw in &self.tickers {
            let ticker = raw.trim().to_uppercase();
            if ticker.is_empty() {
                continue;
            }
            let valid = ticker.len() <= MAX_TICKER_LEN
                && ticker
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
            if !valid {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "invalid ticker: {raw:?}"
                )));
            }
            if !tickers.contains(&ticker) {
                tickers.push(ticker);
            }
        }

        if tickers.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "at least one ticker is required".to_string(),
            ));
        }
        Ok(tickers)
    }
}
