//! Coordination engine
//!
//! Drives one request's task graph to completion. Each submitted request
//! gets a driver task that is the sole writer of its task states: it
//! dispatches every ready task concurrently, applies retry, failover and
//! fail-fast policy as results arrive, and honors cancellation and the
//! request deadline.

use crate::aggregator::ResultAggregator;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::graph::TaskGraph;
use crate::invocation::{AgentInvoker, Invocation};
use crate::registry::{AgentDescriptor, CapabilityRegistry};
use crate::request::AnalysisRequest;
use crate::response::{RequestStatus, Response};
use crate::retry::BackoffPolicy;
use crate::router::TaskRouter;
use crate::task::{FailureReason, TaskId, TaskResult, TaskSpec, TaskState, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use finagent_core::{CancelHandle, CancelReason, CancelSignal, Capability};
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Decides whether a task whose outcome is ambiguous may run again
///
/// Consulted only for non-idempotent agents; idempotent agents are retried
/// without asking.
#[async_trait]
pub trait AmbiguityResolver: Send + Sync {
    async fn confirm_retry(&self, spec: &TaskSpec, result: &TaskResult) -> bool;
}

/// Never confirms a retry
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

#[async_trait]
impl AmbiguityResolver for NeverRetry {
    async fn confirm_retry(&self, _spec: &TaskSpec, _result: &TaskResult) -> bool {
        false
    }
}

/// Always confirms a retry
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConfirm;

#[async_trait]
impl AmbiguityResolver for AlwaysConfirm {
    async fn confirm_retry(&self, _spec: &TaskSpec, _result: &TaskResult) -> bool {
        true
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
    pub at: DateTime<Utc>,
}

/// Final state of a request after its driver finished
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_id: String,
    pub status: RequestStatus,
    pub graph: Arc<TaskGraph>,
    pub results: HashMap<TaskId, TaskResult>,
    pub states: HashMap<TaskId, TaskState>,
    /// Every state change in the order it happened
    pub transitions: Vec<Transition>,
}

impl RequestOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Succeeded
    }

    pub fn result(&self, id: &TaskId) -> Option<&TaskResult> {
        self.results.get(id)
    }

    /// Result of the task serving a capability
    pub fn result_for(&self, capability: Capability) -> Option<&TaskResult> {
        self.results.values().find(|r| r.capability == capability)
    }

    pub fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.states.get(id).copied()
    }

    /// Transitions of one task in order
    pub fn transitions_for<'a>(&'a self, id: &TaskId) -> impl Iterator<Item = &'a Transition> + use<'a> {
        let id = id.clone();
        self.transitions.iter().filter(move |t| t.task_id == id)
    }
}

/// Handle to a submitted request
///
/// Dropping an unfinished handle cancels the request.
pub struct RequestHandle {
    request_id: String,
    graph: Arc<TaskGraph>,
    cancel: CancelHandle,
    join: Option<JoinHandle<RequestOutcome>>,
}

impl RequestHandle {
    pub fn id(&self) -> &str {
        &self.request_id
    }

    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    /// Cancel the request; running agents get the grace period to stop
    pub fn cancel(&self) {
        if self.cancel.cancel(CancelReason::Cancelled) {
            info!(request_id = %self.request_id, "Request cancelled by caller");
        }
    }

    /// Signal observing this request's cancellation
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.signal()
    }

    /// Whether the driver has finished
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `deadline` for the request to finish
    ///
    /// On `Timeout` the request keeps running and may be waited on again.
    pub async fn wait(&mut self, deadline: Duration) -> Result<RequestOutcome> {
        let Some(join) = self.join.as_mut() else {
            return Err(OrchestratorError::AlreadyCompleted(self.request_id.clone()));
        };

        match tokio::time::timeout(deadline, join).await {
            Err(_) => Err(OrchestratorError::Timeout(deadline)),
            Ok(joined) => {
                self.join = None;
                joined.map_err(|e| {
                    OrchestratorError::Internal(format!("request driver failed: {e}"))
                })
            }
        }
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("request_id", &self.request_id)
            .field("tasks", &self.graph.len())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if self.join.as_ref().is_some_and(|j| !j.is_finished())
            && self.cancel.cancel(CancelReason::Cancelled)
        {
            debug!(request_id = %self.request_id, "Request handle dropped, cancelling");
        }
    }
}

/// Multi-agent coordination engine
pub struct CoordinationEngine {
    registry: Arc<CapabilityRegistry>,
    router: TaskRouter,
    invoker: AgentInvoker,
    config: Arc<OrchestratorConfig>,
    resolver: Arc<dyn AmbiguityResolver>,
}

impl CoordinationEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, config: OrchestratorConfig) -> Self {
        let config = Arc::new(config);
        Self {
            registry,
            router: TaskRouter::new(Arc::clone(&config)),
            invoker: AgentInvoker::new(config.cancel_grace_period),
            config,
            resolver: Arc::new(NeverRetry),
        }
    }

    /// Set the resolver consulted on ambiguous outcomes
    pub fn with_resolver(mut self, resolver: Arc<dyn AmbiguityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Route a request and start executing it
    ///
    /// Routing errors are returned immediately and nothing runs. Must be
    /// called from within a Tokio runtime.
    pub fn submit(&self, request: AnalysisRequest) -> Result<RequestHandle> {
        let snapshot = self.registry.snapshot();
        let plan = self.router.route(&request, &snapshot)?;
        let graph = Arc::new(plan.graph);
        let (cancel, signal) = CancelHandle::new();

        info!(
            request_id = %plan.request_id,
            tickers = ?plan.tickers,
            tasks = graph.len(),
            deadline = ?plan.deadline,
            "Submitted request"
        );

        let driver = RequestContext::new(
            plan.request_id.clone(),
            plan.tickers,
            Arc::clone(&graph),
            plan.assignments,
            self.invoker.clone(),
            self.config.backoff.clone(),
            Arc::clone(&self.resolver),
            cancel.clone(),
            signal,
        );
        let join = tokio::spawn(driver.drive(plan.deadline));

        Ok(RequestHandle {
            request_id: plan.request_id,
            graph,
            cancel,
            join: Some(join),
        })
    }

    /// Wait up to `deadline` for a submitted request
    pub async fn wait(&self, handle: &mut RequestHandle, deadline: Duration) -> Result<RequestOutcome> {
        handle.wait(deadline).await
    }

    /// Submit a request, wait for it and aggregate the results
    ///
    /// Routing errors are returned as `Err`; failed executions produce a
    /// non-succeeded [`Response`].
    pub async fn run(&self, request: AnalysisRequest) -> Result<Response> {
        let deadline = request.deadline.unwrap_or(self.config.request_deadline);
        let mut handle = self.submit(request)?;

        // The driver enforces the deadline itself; leave room for the grace period
        let wait_for = deadline
            .saturating_add(self.config.cancel_grace_period)
            .saturating_add(Duration::from_secs(1));
        let outcome = handle.wait(wait_for).await?;
        Ok(ResultAggregator::new().respond(&outcome))
    }
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    /// Index into the task's alternates
    agent_index: usize,
    /// Next attempt number of the current agent
    next_attempt: u32,
    /// Attempts spent by earlier agents
    prior_attempts: u32,
    /// Engine-level retries, for backoff
    retries: u32,
}

impl Progress {
    fn new() -> Self {
        Self {
            agent_index: 0,
            next_attempt: 1,
            prior_attempts: 0,
            retries: 0,
        }
    }

    fn attempts_so_far(&self) -> u32 {
        self.prior_attempts + self.next_attempt - 1
    }
}

enum Event {
    Finished(TaskId, TaskResult),
    RetryDue(TaskId),
    Resolved(TaskId, TaskResult, bool),
}

enum Wakeup {
    Cancel(CancelReason),
    Deadline,
    Event(Event),
}

/// Per-request state, owned by the driver task
struct RequestContext {
    request_id: String,
    tickers: Vec<String>,
    graph: Arc<TaskGraph>,
    assignments: HashMap<TaskId, Arc<[AgentDescriptor]>>,
    states: HashMap<TaskId, TaskState>,
    results: HashMap<TaskId, TaskResult>,
    progress: HashMap<TaskId, Progress>,
    ready: VecDeque<TaskId>,
    transitions: Vec<Transition>,
    invoker: AgentInvoker,
    backoff: BackoffPolicy,
    resolver: Arc<dyn AmbiguityResolver>,
    cancel: CancelHandle,
    signal: CancelSignal,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    fn new(
        request_id: String,
        tickers: Vec<String>,
        graph: Arc<TaskGraph>,
        assignments: HashMap<TaskId, Arc<[AgentDescriptor]>>,
        invoker: AgentInvoker,
        backoff: BackoffPolicy,
        resolver: Arc<dyn AmbiguityResolver>,
        cancel: CancelHandle,
        signal: CancelSignal,
    ) -> Self {
        let states = graph
            .tasks()
            .iter()
            .map(|t| (t.id().clone(), TaskState::Pending))
            .collect();
        let progress = graph
            .tasks()
            .iter()
            .map(|t| (t.id().clone(), Progress::new()))
            .collect();

        Self {
            request_id,
            tickers,
            graph,
            assignments,
            states,
            results: HashMap::new(),
            progress,
            ready: VecDeque::new(),
            transitions: Vec::new(),
            invoker,
            backoff,
            resolver,
            cancel,
            signal,
        }
    }

    async fn drive(mut self, deadline: Duration) -> RequestOutcome {
        let signal = self.signal.clone();
        let deadline_sleep = tokio::time::sleep(deadline);
        tokio::pin!(deadline_sleep);

        let mut in_flight: FuturesUnordered<BoxFuture<'static, Event>> = FuturesUnordered::new();
        let mut cancel_seen = false;
        let mut deadline_fired = false;

        let roots: Vec<TaskId> = self.graph.roots().iter().map(|t| t.id().clone()).collect();
        for id in roots {
            self.make_ready(&id);
        }

        loop {
            while let Some(id) = self.ready.pop_front() {
                in_flight.extend(self.start(&id));
            }

            if in_flight.is_empty() {
                break;
            }

            let step = tokio::select! {
                biased;
                reason = signal.cancelled(), if !cancel_seen => Wakeup::Cancel(reason),
                _ = &mut deadline_sleep, if !deadline_fired => Wakeup::Deadline,
                Some(event) = in_flight.next() => Wakeup::Event(event),
            };

            match step {
                Wakeup::Cancel(reason) => {
                    cancel_seen = true;
                    info!(request_id = %self.request_id, ?reason, "Abandoning unstarted tasks");
                    self.abandon_unstarted(reason.into());
                }
                Wakeup::Deadline => {
                    deadline_fired = true;
                    if self.cancel.cancel(CancelReason::DeadlineExceeded) {
                        warn!(request_id = %self.request_id, ?deadline, "Request deadline exceeded");
                    }
                }
                Wakeup::Event(event) => {
                    if let Some(next) = self.handle(event) {
                        in_flight.push(next);
                    }
                }
            }
        }

        self.finish()
    }

    /// Dispatch a Ready or Retrying task
    fn start(&mut self, id: &TaskId) -> Option<BoxFuture<'static, Event>> {
        let spec = self.graph.get(id).cloned()?;
        self.transition(id, TaskState::Running);

        let progress = self.progress.get(id).copied().unwrap_or_else(Progress::new);
        let descriptor = self
            .assignments
            .get(id)
            .and_then(|agents| agents.get(progress.agent_index))
            .cloned();

        let invocation = Invocation::new(self.effective_input(&spec))
            .with_attempt(progress.next_attempt)
            .with_prior_attempts(progress.prior_attempts)
            .with_cancel_signal(self.signal.clone())
            .with_request(self.request_id.clone(), &self.tickers);

        let task_id = id.clone();
        let Some(descriptor) = descriptor else {
            let result = TaskResult::failed(
                &spec,
                FailureReason::AgentFailed("no agent assigned".into()),
                progress.attempts_so_far(),
            );
            return Some(Box::pin(std::future::ready(Event::Finished(task_id, result))));
        };

        let invoker = self.invoker.clone();
        let fallback_attempts = progress.prior_attempts + progress.next_attempt;
        Some(Box::pin(async move {
            let join = tokio::spawn({
                let spec = spec.clone();
                async move { invoker.invoke(&spec, &descriptor, invocation).await }
            });

            let result = match join.await {
                Ok(result) => result,
                Err(e) => TaskResult::failed(
                    &spec,
                    FailureReason::AgentFailed(format!("agent task panicked: {e}")),
                    fallback_attempts,
                ),
            };
            Event::Finished(task_id, result)
        }))
    }

    /// Task input plus the outputs of its dependencies under `upstream`
    fn effective_input(&self, spec: &TaskSpec) -> Value {
        if spec.dependencies().is_empty() {
            return spec.input().clone();
        }

        let upstream: Map<String, Value> = spec
            .dependencies()
            .iter()
            .filter_map(|dep| {
                let output = self.results.get(dep)?.output.clone()?;
                Some((dep.to_string(), output))
            })
            .collect();

        match spec.input() {
            Value::Object(map) => {
                let mut map = map.clone();
                map.insert("upstream".to_string(), Value::Object(upstream));
                Value::Object(map)
            }
            other => serde_json::json!({ "input": other, "upstream": upstream }),
        }
    }

    fn handle(&mut self, event: Event) -> Option<BoxFuture<'static, Event>> {
        match event {
            Event::Finished(id, result) => self.on_finished(id, result),
            Event::RetryDue(id) => {
                if self.state(&id) != Some(TaskState::Retrying) {
                    return None;
                }
                if let Some(reason) = self.signal.reason() {
                    self.abandon_with(&id, reason.into());
                    return None;
                }
                self.start(&id)
            }
            Event::Resolved(id, result, confirmed) => {
                if self.state(&id) != Some(TaskState::Failed) {
                    return None;
                }
                let within_budget = self.within_budget(&id);
                if confirmed && within_budget && !self.signal.is_cancelled() {
                    info!(task_id = %id, "Retry of ambiguous outcome confirmed");
                    Some(self.schedule_retry(&id))
                } else {
                    self.abandon(&id, result);
                    None
                }
            }
        }
    }

    fn on_finished(&mut self, id: TaskId, result: TaskResult) -> Option<BoxFuture<'static, Event>> {
        if self.state(&id) != Some(TaskState::Running) {
            debug!(task_id = %id, "Ignoring result for task that is no longer running");
            return None;
        }

        if let Some(progress) = self.progress.get_mut(&id) {
            let used = result.attempts.saturating_sub(progress.prior_attempts);
            progress.next_attempt = used.max(progress.next_attempt) + 1;
        }

        if result.status.is_success() {
            info!(
                task_id = %id,
                attempts = result.attempts,
                status = ?result.status,
                agent = result.agent.as_deref().unwrap_or_default(),
                "Task succeeded"
            );
            self.transition(&id, TaskState::Succeeded);
            self.results.insert(id.clone(), result);
            self.promote_dependents(&id);
            return None;
        }

        if result.status == TaskStatus::Abandoned {
            self.transition(&id, TaskState::Abandoned);
            self.record_abandoned(&id, result);
            return None;
        }

        self.transition(&id, TaskState::Failed);
        let reason = result
            .reason
            .clone()
            .unwrap_or_else(|| FailureReason::AgentFailed("unknown failure".into()));
        let idempotent = self.current_agent(&id).is_some_and(AgentDescriptor::is_idempotent);

        if self.signal.is_cancelled() {
            self.abandon(&id, result);
            return None;
        }

        if reason == FailureReason::AmbiguousOutcome && !idempotent {
            warn!(task_id = %id, "Ambiguous outcome on non-idempotent agent, asking resolver");
            return Some(self.resolve_ambiguity(&id, result));
        }

        if reason.is_retryable(idempotent) && self.within_budget(&id) {
            warn!(task_id = %id, %reason, attempts = result.attempts, "Retrying task");
            return Some(self.schedule_retry(&id));
        }

        if reason.allows_failover() && self.advance_agent(&id, result.attempts) {
            warn!(task_id = %id, %reason, "Failing over to alternate agent");
            self.transition(&id, TaskState::Retrying);
            return Some(Box::pin(std::future::ready(Event::RetryDue(id))));
        }

        warn!(task_id = %id, %reason, attempts = result.attempts, "Task abandoned");
        self.abandon(&id, result);
        None
    }

    fn schedule_retry(&mut self, id: &TaskId) -> BoxFuture<'static, Event> {
        self.transition(id, TaskState::Retrying);

        let retries = match self.progress.get_mut(id) {
            Some(progress) => {
                progress.retries += 1;
                progress.retries
            }
            None => 1,
        };
        let delay = self.backoff.backoff_duration(retries);
        let signal = self.signal.clone();
        let id = id.clone();

        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = signal.cancelled() => {}
            }
            Event::RetryDue(id)
        })
    }

    fn resolve_ambiguity(&self, id: &TaskId, result: TaskResult) -> BoxFuture<'static, Event> {
        let resolver = Arc::clone(&self.resolver);
        let signal = self.signal.clone();
        let spec = self.graph.get(id).cloned();
        let id = id.clone();

        Box::pin(async move {
            let confirmed = match spec {
                Some(spec) => tokio::select! {
                    confirmed = resolver.confirm_retry(&spec, &result) => confirmed,
                    _ = signal.cancelled() => false,
                },
                None => false,
            };
            Event::Resolved(id, result, confirmed)
        })
    }

    fn within_budget(&self, id: &TaskId) -> bool {
        match (self.graph.get(id), self.progress.get(id)) {
            (Some(spec), Some(progress)) => progress.next_attempt <= spec.max_attempts(),
            _ => false,
        }
    }

    fn current_agent(&self, id: &TaskId) -> Option<&AgentDescriptor> {
        let index = self.progress.get(id)?.agent_index;
        self.assignments.get(id)?.get(index)
    }

    /// Move to the next alternate agent, if there is one
    fn advance_agent(&mut self, id: &TaskId, attempts: u32) -> bool {
        let alternates = self.assignments.get(id).map_or(0, |agents| agents.len());
        let Some(progress) = self.progress.get_mut(id) else {
            return false;
        };
        if progress.agent_index + 1 >= alternates {
            return false;
        }

        progress.agent_index += 1;
        progress.prior_attempts = attempts;
        progress.next_attempt = 1;
        true
    }

    fn make_ready(&mut self, id: &TaskId) {
        if self.transition(id, TaskState::Ready) {
            self.ready.push_back(id.clone());
        }
    }

    /// Make every dependent whose dependencies all succeeded ready
    fn promote_dependents(&mut self, id: &TaskId) {
        let candidates: Vec<TaskId> = self
            .graph
            .dependents(id)
            .iter()
            .filter(|t| {
                t.dependencies()
                    .iter()
                    .all(|dep| self.state(dep) == Some(TaskState::Succeeded))
            })
            .map(|t| t.id().clone())
            .collect();

        for candidate in candidates {
            if self.state(&candidate) != Some(TaskState::Pending) {
                continue;
            }
            match self.signal.reason() {
                Some(reason) => self.abandon_with(&candidate, reason.into()),
                None => self.make_ready(&candidate),
            }
        }
    }

    /// Abandon a failed task and everything downstream of it
    fn abandon(&mut self, id: &TaskId, result: TaskResult) {
        self.transition(id, TaskState::Abandoned);
        self.record_abandoned(id, result.into_abandoned());
    }

    fn record_abandoned(&mut self, id: &TaskId, result: TaskResult) {
        self.results.insert(id.clone(), result);

        let downstream: Vec<TaskId> = self
            .graph
            .transitive_dependents(id)
            .iter()
            .map(|t| t.id().clone())
            .collect();

        for dependent in downstream {
            if self.state(&dependent).is_some_and(|s| !s.is_terminal()) {
                self.abandon_with(&dependent, FailureReason::DependencyAbandoned(id.clone()));
            }
        }
    }

    /// Abandon a task that is not running, recording `reason`
    fn abandon_with(&mut self, id: &TaskId, reason: FailureReason) {
        let Some(spec) = self.graph.get(id) else {
            return;
        };
        let attempts = self
            .progress
            .get(id)
            .map_or(0, Progress::attempts_so_far);
        let result = TaskResult::abandoned(spec, reason, attempts);

        if self.transition(id, TaskState::Abandoned) {
            self.ready.retain(|queued| queued != id);
            self.results.insert(id.clone(), result);
        }
    }

    /// Abandon every task that is not running or terminal
    fn abandon_unstarted(&mut self, reason: FailureReason) {
        let unstarted: Vec<TaskId> = self
            .graph
            .topological_order()
            .map(|t| t.id().clone())
            .filter(|id| {
                matches!(
                    self.state(id),
                    Some(TaskState::Pending | TaskState::Ready | TaskState::Retrying | TaskState::Failed)
                )
            })
            .collect();

        for id in unstarted {
            self.abandon_with(&id, reason.clone());
        }
        self.ready.clear();
    }

    fn state(&self, id: &TaskId) -> Option<TaskState> {
        self.states.get(id).copied()
    }

    /// Apply a state change if the state machine allows it
    fn transition(&mut self, id: &TaskId, to: TaskState) -> bool {
        let Some(from) = self.state(id) else {
            return false;
        };
        if !from.can_transition_to(to) {
            error!(task_id = %id, %from, %to, "Rejected illegal task transition");
            return false;
        }

        debug!(request_id = %self.request_id, task_id = %id, %from, %to, "Task transition");
        self.states.insert(id.clone(), to);
        self.transitions.push(Transition {
            task_id: id.clone(),
            from,
            to,
            at: Utc::now(),
        });
        true
    }

    fn finish(mut self) -> RequestOutcome {
        let stranded: Vec<TaskId> = self
            .graph
            .topological_order()
            .map(|t| t.id().clone())
            .filter(|id| self.state(id).is_some_and(|s| !s.is_terminal()))
            .collect();
        for id in stranded {
            error!(task_id = %id, "Task never reached a terminal state");
            self.abandon_with(&id, FailureReason::AgentFailed("task stranded".into()));
        }

        let all_succeeded = self
            .states
            .values()
            .all(|state| *state == TaskState::Succeeded);
        let status = if all_succeeded {
            RequestStatus::Succeeded
        } else {
            match self.signal.reason() {
                Some(CancelReason::Cancelled) => RequestStatus::Cancelled,
                Some(CancelReason::DeadlineExceeded) => RequestStatus::TimedOut,
                None => RequestStatus::Failed,
            }
        };

        info!(
            request_id = %self.request_id,
            status = status.as_str(),
            transitions = self.transitions.len(),
            "Request finished"
        );

        RequestOutcome {
            request_id: self.request_id,
            status,
            graph: self.graph,
            results: self.results,
            states: self.states,
            transitions: self.transitions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentDescriptor;
    use crate::request::DependencyOverride;
    use crate::test_support::{CritiqueStep, Pipeline, ScriptedAgent, Step, fast_config};
    use finagent_core::{Agent, Critique};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn engine(pipeline: &Pipeline) -> CoordinationEngine {
        CoordinationEngine::new(Arc::new(pipeline.registry()), fast_config())
    }

    fn id(capability: Capability) -> TaskId {
        TaskId::from(capability)
    }

    async fn wait_until_started(agent: &ScriptedAgent) {
        for _ in 0..200 {
            if agent.executions() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("agent {} never started", agent.name());
    }

    #[tokio::test]
    async fn test_full_pipeline_succeeds() {
        let pipeline = Pipeline::new();
        let response = assert_ok!(engine(&pipeline).run(AnalysisRequest::full_pipeline(["XYZ"])).await);

        assert!(response.is_success());
        assert_eq!(response.capabilities(), Capability::ALL.to_vec());
        for capability in Capability::ALL {
            assert_eq!(pipeline.agent(capability).executions(), 1);
        }
    }

    #[tokio::test]
    async fn test_risk_timeout_then_retry_succeeds() {
        let pipeline = Pipeline::new().with(
            Capability::RiskAssessment,
            ScriptedAgent::new("risk")
                .then(Step::Sleep(Duration::from_secs(2), json!({"var": 0.5})))
                .then(Step::Succeed(json!({"var": 0.1}))),
        );
        let request = AnalysisRequest::full_pipeline(["XYZ"]).with_deadline(Duration::from_secs(30));
        let response = assert_ok!(engine(&pipeline).run(request).await);

        assert_eq!(response.status, RequestStatus::Succeeded);
        let risk = response.section(Capability::RiskAssessment).unwrap();
        assert_eq!(risk.attempts, 2);
        assert_eq!(risk.output, json!({"var": 0.1}));
        assert_eq!(response.section(Capability::Decision).unwrap().status, TaskStatus::Succeeded);
        assert_eq!(response.section(Capability::Monitor).unwrap().status, TaskStatus::Succeeded);
        assert_eq!(
            response.capabilities(),
            vec![
                Capability::Ingest,
                Capability::TechnicalAnalysis,
                Capability::FundamentalAnalysis,
                Capability::RiskAssessment,
                Capability::Decision,
                Capability::Monitor,
            ]
        );
    }

    #[tokio::test]
    async fn test_ingestion_abandoned_fails_fast() {
        let pipeline = Pipeline::new().with(
            Capability::Ingest,
            ScriptedAgent::new("ingest").otherwise(Step::Fail("quote feed down".into())),
        );
        let response = assert_ok!(engine(&pipeline).run(AnalysisRequest::full_pipeline(["XYZ"])).await);

        assert_ne!(response.status, RequestStatus::Succeeded);
        assert!(response.sections.is_empty());
        let failure = response.failure.as_ref().unwrap();
        assert_eq!(failure.task_id, id(Capability::Ingest));
        assert!(matches!(
            failure.to_error(),
            OrchestratorError::IncompleteAnalysis { ref task_id, .. } if *task_id == id(Capability::Ingest)
        ));

        assert_eq!(pipeline.agent(Capability::Ingest).executions(), 3);
        for capability in &Capability::ALL[1..] {
            assert_eq!(pipeline.agent(*capability).executions(), 0, "{capability} must not run");
        }
    }

    #[tokio::test]
    async fn test_no_task_runs_before_dependencies_succeed() {
        let pipeline = Pipeline::new()
            .with(
                Capability::TechnicalAnalysis,
                ScriptedAgent::new("tech").then(Step::Sleep(Duration::from_millis(30), json!({}))),
            )
            .with(
                Capability::FundamentalAnalysis,
                ScriptedAgent::new("fund").then(Step::Fail("flaky".into())),
            );
        let engine = engine(&pipeline);
        let mut handle = assert_ok!(engine.submit(AnalysisRequest::full_pipeline(["XYZ"])));
        let outcome = assert_ok!(handle.wait(Duration::from_secs(5)).await);
        assert!(outcome.is_success());

        for (index, transition) in outcome.transitions.iter().enumerate() {
            if transition.to != TaskState::Running {
                continue;
            }
            let spec = outcome.graph.get(&transition.task_id).unwrap();
            for dep in spec.dependencies() {
                let succeeded_before = outcome.transitions[..index]
                    .iter()
                    .any(|t| &t.task_id == dep && t.to == TaskState::Succeeded);
                assert!(succeeded_before, "{} started before {dep} succeeded", transition.task_id);
            }
        }

        let fundamental: Vec<TaskState> = outcome
            .transitions_for(&id(Capability::FundamentalAnalysis))
            .map(|t| t.to)
            .collect();
        assert_eq!(
            fundamental,
            vec![
                TaskState::Ready,
                TaskState::Running,
                TaskState::Failed,
                TaskState::Retrying,
                TaskState::Running,
                TaskState::Succeeded,
            ]
        );
    }

    #[tokio::test]
    async fn test_idempotent_timeouts_converge() {
        let pipeline = Pipeline::new().with(
            Capability::Decision,
            ScriptedAgent::new("decision").otherwise(Step::Sleep(Duration::from_secs(2), json!({}))),
        );
        let engine = CoordinationEngine::new(
            Arc::new(pipeline.registry()),
            OrchestratorConfig::builder()
                .default_timeout(Duration::from_millis(30))
                .default_max_retries(2)
                .backoff(BackoffPolicy::none())
                .build()
                .unwrap(),
        );

        let mut handle = assert_ok!(engine.submit(AnalysisRequest::full_pipeline(["XYZ"])));
        let outcome = assert_ok!(handle.wait(Duration::from_secs(5)).await);

        assert_eq!(outcome.status, RequestStatus::Failed);
        assert!(outcome.states.values().all(TaskState::is_terminal));
        let decision = outcome.result_for(Capability::Decision).unwrap();
        assert_eq!(decision.status, TaskStatus::Abandoned);
        assert_eq!(decision.reason, Some(FailureReason::Timeout));
        assert_eq!(decision.attempts, 3);
        assert_eq!(pipeline.agent(Capability::Decision).executions(), 3);

        let monitor = outcome.result_for(Capability::Monitor).unwrap();
        assert_eq!(
            monitor.reason,
            Some(FailureReason::DependencyAbandoned(id(Capability::Decision)))
        );
        assert_eq!(pipeline.agent(Capability::Monitor).executions(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_analysis_propagates_downstream() {
        let pipeline = Pipeline::new().with(
            Capability::TechnicalAnalysis,
            ScriptedAgent::new("tech").otherwise(Step::Fail("no price history".into())),
        );
        let engine = engine(&pipeline);
        let mut handle = assert_ok!(engine.submit(AnalysisRequest::full_pipeline(["XYZ"])));
        let outcome = assert_ok!(handle.wait(Duration::from_secs(5)).await);

        assert_eq!(outcome.state(&id(Capability::FundamentalAnalysis)), Some(TaskState::Succeeded));
        for capability in [Capability::RiskAssessment, Capability::Decision, Capability::Monitor] {
            assert_eq!(outcome.state(&id(capability)), Some(TaskState::Abandoned));
            assert_eq!(pipeline.agent(capability).executions(), 0);
            let transitions: Vec<TaskState> =
                outcome.transitions_for(&id(capability)).map(|t| t.to).collect();
            assert_eq!(transitions, vec![TaskState::Abandoned]);
        }

        let response = ResultAggregator::new().respond(&outcome);
        assert_eq!(response.failure.unwrap().task_id, id(Capability::TechnicalAnalysis));
    }

    #[tokio::test]
    async fn test_cancel_mid_flight_abandons_running_analyses() {
        let pipeline = Pipeline::new()
            .with(Capability::TechnicalAnalysis, ScriptedAgent::new("tech").then(Step::Hang))
            .with(Capability::FundamentalAnalysis, ScriptedAgent::new("fund").then(Step::Hang));
        let engine = engine(&pipeline);
        let mut handle = assert_ok!(engine.submit(AnalysisRequest::full_pipeline(["XYZ"])));

        wait_until_started(&pipeline.agent(Capability::TechnicalAnalysis)).await;
        wait_until_started(&pipeline.agent(Capability::FundamentalAnalysis)).await;

        let cancelled_at = Utc::now();
        handle.cancel();
        let outcome = assert_ok!(handle.wait(Duration::from_secs(2)).await);

        assert_eq!(outcome.status, RequestStatus::Cancelled);
        let grace = chrono::Duration::milliseconds(50 + 250);
        for capability in [Capability::TechnicalAnalysis, Capability::FundamentalAnalysis] {
            let result = outcome.result_for(capability).unwrap();
            assert_eq!(result.status, TaskStatus::Abandoned);
            assert_eq!(result.reason, Some(FailureReason::Cancelled));

            let task = id(capability);
            let last = outcome.transitions_for(&task).last().unwrap();
            assert_eq!(last.to, TaskState::Abandoned);
            assert!(last.at - cancelled_at < grace, "{capability} abandoned too late");
        }

        for capability in [Capability::RiskAssessment, Capability::Decision, Capability::Monitor] {
            assert_eq!(pipeline.agent(capability).executions(), 0);
            assert_eq!(outcome.state(&id(capability)), Some(TaskState::Abandoned));
        }

        // Exactly one terminal transition per task, none after it
        for task in outcome.graph.tasks() {
            let transitions: Vec<&Transition> = outcome.transitions_for(task.id()).collect();
            let terminal = transitions.iter().filter(|t| t.to.is_terminal()).count();
            assert_eq!(terminal, 1);
            assert!(transitions.last().unwrap().to.is_terminal());
        }
    }

    #[tokio::test]
    async fn test_stubborn_agent_forced_after_grace_period() {
        let pipeline = Pipeline::new()
            .with(Capability::TechnicalAnalysis, ScriptedAgent::new("tech").then(Step::Stubborn));
        let engine = CoordinationEngine::new(
            Arc::new(pipeline.registry()),
            OrchestratorConfig::builder()
                .default_timeout(Duration::from_secs(10))
                .cancel_grace_period(Duration::from_millis(50))
                .build()
                .unwrap(),
        );
        let mut handle = assert_ok!(engine.submit(AnalysisRequest::full_pipeline(["XYZ"])));
        wait_until_started(&pipeline.agent(Capability::TechnicalAnalysis)).await;

        let started = tokio::time::Instant::now();
        handle.cancel();
        let outcome = assert_ok!(handle.wait(Duration::from_secs(2)).await);

        assert!(started.elapsed() < Duration::from_secs(1));
        let tech = outcome.result_for(Capability::TechnicalAnalysis).unwrap();
        assert_eq!(tech.status, TaskStatus::Abandoned);
        assert_eq!(tech.reason, Some(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn test_request_deadline_abandons_in_flight_work() {
        let pipeline = Pipeline::new()
            .with(Capability::TechnicalAnalysis, ScriptedAgent::new("tech").then(Step::Hang));
        let engine = engine(&pipeline);
        let request = AnalysisRequest::full_pipeline(["XYZ"]).with_deadline(Duration::from_millis(100));
        let response = assert_ok!(engine.run(request).await);

        assert_eq!(response.status, RequestStatus::TimedOut);
        let failure = response.failure.unwrap();
        assert_eq!(failure.task_id, id(Capability::TechnicalAnalysis));
        assert_eq!(failure.reason, FailureReason::DeadlineExceeded);
        assert_eq!(pipeline.agent(Capability::RiskAssessment).executions(), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_outcome_not_retried_for_non_idempotent_agent() {
        let pipeline = Pipeline::new()
            .with(Capability::Decision, ScriptedAgent::new("decision").then(Step::Ambiguous))
            .non_idempotent(Capability::Decision);
        let response = assert_ok!(engine(&pipeline).run(AnalysisRequest::full_pipeline(["XYZ"])).await);

        assert_eq!(response.status, RequestStatus::Failed);
        let failure = response.failure.unwrap();
        assert_eq!(failure.task_id, id(Capability::Decision));
        assert_eq!(failure.reason, FailureReason::AmbiguousOutcome);
        assert_eq!(pipeline.agent(Capability::Decision).executions(), 1);
        assert_eq!(pipeline.agent(Capability::Monitor).executions(), 0);
    }

    #[tokio::test]
    async fn test_resolver_can_confirm_ambiguous_retry() {
        let pipeline = Pipeline::new()
            .with(Capability::Decision, ScriptedAgent::new("decision").then(Step::Ambiguous))
            .non_idempotent(Capability::Decision);
        let engine = engine(&pipeline).with_resolver(Arc::new(AlwaysConfirm));
        let response = assert_ok!(engine.run(AnalysisRequest::full_pipeline(["XYZ"])).await);

        assert!(response.is_success());
        assert_eq!(response.section(Capability::Decision).unwrap().attempts, 2);
        assert_eq!(pipeline.agent(Capability::Decision).executions(), 2);
    }

    #[tokio::test]
    async fn test_ambiguous_outcome_retried_for_idempotent_agent() {
        let pipeline = Pipeline::new()
            .with(Capability::Ingest, ScriptedAgent::new("ingest").then(Step::Ambiguous));
        let response = assert_ok!(engine(&pipeline).run(AnalysisRequest::full_pipeline(["XYZ"])).await);

        assert!(response.is_success());
        assert_eq!(pipeline.agent(Capability::Ingest).executions(), 2);
    }

    #[tokio::test]
    async fn test_failover_to_alternate_agent() {
        let primary = Arc::new(ScriptedAgent::new("primary").otherwise(Step::Fail("bad data".into())));
        let backup = Arc::new(ScriptedAgent::new("backup"));

        let pipeline = Pipeline::new();
        let registry = CapabilityRegistry::new().allow_fan_out(Capability::TechnicalAnalysis);
        for capability in Capability::ALL {
            if capability == Capability::TechnicalAnalysis {
                continue;
            }
            let agent: Arc<dyn Agent> = pipeline.agent(capability);
            registry.register(AgentDescriptor::new(capability, agent).idempotent(true)).unwrap();
        }
        for agent in [&primary, &backup] {
            let agent: Arc<dyn Agent> = agent.clone();
            registry
                .register(AgentDescriptor::new(Capability::TechnicalAnalysis, agent).idempotent(true))
                .unwrap();
        }

        let engine = CoordinationEngine::new(Arc::new(registry), fast_config());
        let response = assert_ok!(engine.run(AnalysisRequest::full_pipeline(["XYZ"])).await);

        assert!(response.is_success());
        let tech = response.section(Capability::TechnicalAnalysis).unwrap();
        assert_eq!(tech.agent.as_deref(), Some("backup"));
        assert_eq!(tech.attempts, 4);
        assert_eq!(primary.executions(), 3);
        assert_eq!(backup.executions(), 1);
        assert_eq!(backup.attempts_seen(), vec![1]);
    }

    #[tokio::test]
    async fn test_construction_errors_execute_nothing() {
        let pipeline = Pipeline::new();
        let registry = CapabilityRegistry::new();
        for capability in &Capability::ALL[..5] {
            let agent: Arc<dyn Agent> = pipeline.agent(*capability);
            registry.register(AgentDescriptor::new(*capability, agent)).unwrap();
        }
        let engine = CoordinationEngine::new(Arc::new(registry), fast_config());

        let err = assert_err!(engine.submit(AnalysisRequest::full_pipeline(["XYZ"])));
        assert_eq!(err, OrchestratorError::UnroutableRequest(Capability::Monitor));

        let cyclic = AnalysisRequest::for_kinds([Capability::Decision], ["XYZ"]).with_override(
            DependencyOverride::new(Capability::Ingest, [id(Capability::Decision)]),
        );
        let err = assert_err!(engine.run(cyclic).await);
        assert!(matches!(err, OrchestratorError::CyclicDependency(_)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        for capability in Capability::ALL {
            assert_eq!(pipeline.agent(capability).executions(), 0);
        }
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_request_running() {
        let pipeline = Pipeline::new().with(
            Capability::TechnicalAnalysis,
            ScriptedAgent::new("tech").then(Step::Sleep(Duration::from_millis(100), json!({"trend": "up"}))),
        );
        let engine = engine(&pipeline);
        let mut handle = assert_ok!(engine.submit(AnalysisRequest::full_pipeline(["XYZ"])));

        let err = assert_err!(engine.wait(&mut handle, Duration::from_millis(10)).await);
        assert_eq!(err, OrchestratorError::Timeout(Duration::from_millis(10)));
        assert!(!handle.is_finished());

        let outcome = assert_ok!(engine.wait(&mut handle, Duration::from_secs(5)).await);
        assert!(outcome.is_success());

        let err = assert_err!(handle.wait(Duration::from_secs(1)).await);
        assert!(matches!(err, OrchestratorError::AlreadyCompleted(_)));
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_request() {
        let pipeline = Pipeline::new()
            .with(Capability::TechnicalAnalysis, ScriptedAgent::new("tech").then(Step::Hang));
        let engine = engine(&pipeline);
        let handle = assert_ok!(engine.submit(AnalysisRequest::full_pipeline(["XYZ"])));
        let signal = handle.cancel_signal();

        wait_until_started(&pipeline.agent(Capability::TechnicalAnalysis)).await;
        drop(handle);

        assert_eq!(signal.reason(), Some(CancelReason::Cancelled));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pipeline.agent(Capability::RiskAssessment).executions(), 0);
    }

    #[tokio::test]
    async fn test_upstream_outputs_reach_dependents() {
        let pipeline = Pipeline::new()
            .with(
                Capability::TechnicalAnalysis,
                ScriptedAgent::new("tech").then(Step::Succeed(json!({"trend": "up"}))),
            )
            .with(
                Capability::FundamentalAnalysis,
                ScriptedAgent::new("fund").then(Step::Succeed(json!({"pe": 18.5}))),
            );
        let response = assert_ok!(engine(&pipeline).run(AnalysisRequest::full_pipeline(["xyz"])).await);
        assert!(response.is_success());

        let risk_input = &pipeline.agent(Capability::RiskAssessment).inputs()[0];
        assert_eq!(risk_input["upstream"]["technical-analysis"], json!({"trend": "up"}));
        assert_eq!(risk_input["upstream"]["fundamental-analysis"], json!({"pe": 18.5}));
        assert_eq!(risk_input["tickers"], json!(["XYZ"]));
        assert!(risk_input["upstream"].get("ingest").is_none());
    }

    #[tokio::test]
    async fn test_self_critique_bounded_inside_engine() {
        let pipeline = Pipeline::new().with(
            Capability::TechnicalAnalysis,
            ScriptedAgent::new("tech")
                .critique_otherwise(CritiqueStep::Verdict(Critique::revise(0.3, "weak signal"))),
        );
        let response = assert_ok!(engine(&pipeline).run(AnalysisRequest::full_pipeline(["XYZ"])).await);

        assert!(response.is_success());
        let tech = response.section(Capability::TechnicalAnalysis).unwrap();
        assert_eq!(tech.status, TaskStatus::Revised);
        assert_eq!(tech.attempts, 3);
        assert_eq!(tech.critique_score, Some(0.3));
        assert_eq!(pipeline.agent(Capability::TechnicalAnalysis).executions(), 3);
    }

    #[tokio::test]
    async fn test_unbounded_deadline_does_not_overflow() {
        let pipeline = Pipeline::new();
        let request = AnalysisRequest::full_pipeline(["XYZ"]).with_deadline(Duration::MAX);
        let response = assert_ok!(engine(&pipeline).run(request).await);

        assert!(response.is_success());
        assert_eq!(response.sections.len(), Capability::ALL.len());
    }

    #[tokio::test]
    async fn test_handle_debug_and_transitions_for_temporary_id() {
        let pipeline = Pipeline::new();
        let engine = engine(&pipeline);
        let mut handle = assert_ok!(engine.submit(AnalysisRequest::full_pipeline(["XYZ"]).with_id("req-debug")));

        let rendered = format!("{handle:?}");
        assert!(rendered.contains("req-debug"));
        assert!(rendered.contains("tasks: 6"));

        let outcome = assert_ok!(handle.wait(Duration::from_secs(5)).await);
        let last = outcome.transitions_for(&id(Capability::Monitor)).last().map(|t| t.to);
        assert_eq!(last, Some(TaskState::Succeeded));
    }
}
