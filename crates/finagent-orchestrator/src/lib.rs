//! Multi-agent orchestration for finagent
//!
//! Routes analysis requests to registered agents, runs the resulting task
//! graph with retries, self-critique and cancellation, and merges the
//! per-task results into a single response.
//!
//! # Example
//!
//! ```no_run
//! use finagent_orchestrator::{AnalysisRequest, CapabilityRegistry, CoordinationEngine, OrchestratorConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> finagent_orchestrator::Result<()> {
//! let registry = Arc::new(CapabilityRegistry::new());
//! // register one agent per capability here
//! let engine = CoordinationEngine::new(registry, OrchestratorConfig::default());
//! let response = engine.run(AnalysisRequest::full_pipeline(["AAPL"])).await?;
//! println!("{}", response.format_summary());
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod intent;
pub mod invocation;
pub mod registry;
pub mod request;
pub mod response;
pub mod retry;
pub mod router;
pub mod task;

#[cfg(test)]
mod test_support;

// Re-export for convenience
pub use aggregator::ResultAggregator;
pub use config::{CapabilityConfig, OrchestratorConfig, OrchestratorConfigBuilder};
pub use engine::{
    AlwaysConfirm, AmbiguityResolver, CoordinationEngine, NeverRetry, RequestHandle,
    RequestOutcome, Transition,
};
pub use error::{OrchestratorError, Result};
pub use graph::TaskGraph;
pub use intent::IntentClassifier;
pub use invocation::{AgentInvoker, Invocation};
pub use registry::{AgentDescriptor, CapabilityRegistry, RegistrationPolicy, RegistrySnapshot};
pub use request::{AnalysisRequest, DependencyOverride, TaskSelection};
pub use response::{FailureSummary, RequestStatus, Response, TaskSection};
pub use retry::BackoffPolicy;
pub use router::{RoutePlan, TaskRouter, canonical_dependencies};
pub use task::{FailureReason, TaskId, TaskResult, TaskSpec, TaskState, TaskStatus};
