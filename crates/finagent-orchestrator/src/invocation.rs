//! Agent invocation wrapper
//!
//! Runs one task against one agent: every execution is bounded by the task
//! timeout and by the request's cancellation signal, and agents that support
//! self-critique are re-invoked with their own feedback until they accept
//! the output or the attempt budget is spent. Retrying failed executions is
//! left to the engine.

use crate::registry::AgentDescriptor;
use crate::task::{FailureReason, TaskResult, TaskSpec};
use finagent_core::{CancelReason, CancelSignal, Context, Critique, Error};
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything one call of [`AgentInvoker::invoke`] needs besides the task
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Task input merged with upstream outputs
    pub input: Value,
    /// Attempt number, 1-based, counted per agent
    pub attempt: u32,
    /// Attempts already spent on this task by previous agents
    pub prior_attempts: u32,
    pub cancel: CancelSignal,
    pub request_id: String,
    pub tickers: Vec<String>,
}

impl Invocation {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            attempt: 1,
            prior_attempts: 0,
            cancel: CancelSignal::never(),
            request_id: String::new(),
            tickers: Vec::new(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn with_prior_attempts(mut self, prior_attempts: u32) -> Self {
        self.prior_attempts = prior_attempts;
        self
    }

    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_request(mut self, request_id: impl Into<String>, tickers: &[String]) -> Self {
        self.request_id = request_id.into();
        self.tickers = tickers.to_vec();
        self
    }

    fn context(&self, spec: &TaskSpec, attempt: u32) -> Context {
        Context::new()
            .with_request_id(self.request_id.clone())
            .with_task_id(spec.id().as_str())
            .with_attempt(attempt)
            .with_tickers(&self.tickers)
            .with_cancel_signal(self.cancel.clone())
    }
}

enum Bounded<T> {
    Completed(T),
    TimedOut,
    Cancelled(CancelReason),
}

/// Executes tasks against agents
#[derive(Debug, Clone)]
pub struct AgentInvoker {
    grace_period: Duration,
}

impl Default for AgentInvoker {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl AgentInvoker {
    /// Create an invoker giving cancelled agents `grace_period` to return
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Run a task against an agent
    ///
    /// Never runs more than `spec.max_attempts()` executions for this agent,
    /// counting from `invocation.attempt`. The reported attempt count
    /// includes `invocation.prior_attempts`.
    pub async fn invoke(
        &self,
        spec: &TaskSpec,
        descriptor: &AgentDescriptor,
        invocation: Invocation,
    ) -> TaskResult {
        let agent = descriptor.agent();
        let max_attempts = spec.max_attempts();
        let mut attempt = invocation.attempt.max(1);
        let mut input = invocation.input.clone();
        let mut best: Option<(Value, f64)> = None;
        let mut revisions = 0u32;

        let finish = |result: TaskResult| result.with_agent(descriptor.name());
        let attempts = |attempt: u32| invocation.prior_attempts.saturating_add(attempt);

        loop {
            if let Some(reason) = invocation.cancel.reason() {
                return finish(TaskResult::abandoned(spec, reason.into(), attempts(attempt - 1)));
            }

            debug!(
                task_id = %spec.id(),
                agent = descriptor.name(),
                attempt,
                max_attempts,
                "Executing task"
            );

            let context = invocation.context(spec, attempt);
            let outcome = self
                .run_bounded(
                    agent.execute(input.clone(), &context),
                    spec.timeout(),
                    &invocation.cancel,
                )
                .await;
            let output = match outcome {
                Bounded::Completed(Ok(output)) => output,
                Bounded::Completed(Err(err)) => {
                    let reason = classify_error(&err, &invocation.cancel);
                    if matches!(reason, FailureReason::Cancelled | FailureReason::DeadlineExceeded) {
                        info!(task_id = %spec.id(), attempt, %reason, "Task abandoned after cancellation");
                        return finish(TaskResult::abandoned(spec, reason, attempts(attempt)));
                    }
                    if let Some((output, score)) = best.take() {
                        warn!(task_id = %spec.id(), attempt, error = %err, "Revision failed, keeping best output");
                        return finish(finalized(spec, output, Some(score), attempts(attempt), revisions));
                    }
                    warn!(task_id = %spec.id(), attempt, %reason, "Task execution failed");
                    return finish(TaskResult::failed(spec, reason, attempts(attempt)));
                }
                Bounded::TimedOut => {
                    if let Some((output, score)) = best.take() {
                        warn!(task_id = %spec.id(), attempt, "Revision timed out, keeping best output");
                        return finish(finalized(spec, output, Some(score), attempts(attempt), revisions));
                    }
                    // Completion status of a timed-out call is unknown
                    let reason = if descriptor.is_idempotent() {
                        FailureReason::Timeout
                    } else {
                        FailureReason::AmbiguousOutcome
                    };
                    warn!(task_id = %spec.id(), attempt, timeout = ?spec.timeout(), %reason, "Task timed out");
                    return finish(TaskResult::failed(spec, reason, attempts(attempt)));
                }
                Bounded::Cancelled(reason) => {
                    info!(task_id = %spec.id(), attempt, ?reason, "Task abandoned after cancellation");
                    return finish(TaskResult::abandoned(spec, reason.into(), attempts(attempt)));
                }
            };

            if !agent.supports_critique() {
                return finish(finalized(spec, output, None, attempts(attempt), revisions));
            }

            let verdict = self
                .run_bounded(
                    agent.critique(&invocation.input, &output, &context),
                    spec.timeout(),
                    &invocation.cancel,
                )
                .await;
            let critique = match verdict {
                Bounded::Completed(Ok(critique)) => critique,
                Bounded::Completed(Err(err))
                    if matches!(
                        classify_error(&err, &invocation.cancel),
                        FailureReason::Cancelled | FailureReason::DeadlineExceeded
                    ) =>
                {
                    let reason = classify_error(&err, &invocation.cancel);
                    return finish(TaskResult::abandoned(spec, reason, attempts(attempt)));
                }
                Bounded::Completed(Err(_)) | Bounded::TimedOut => {
                    warn!(task_id = %spec.id(), attempt, "Critique failed, finalizing best output");
                    let (output, score) = match best.take() {
                        Some((best_output, score)) => (best_output, Some(score)),
                        None => (output, None),
                    };
                    return finish(finalized(spec, output, score, attempts(attempt), revisions));
                }
                Bounded::Cancelled(reason) => {
                    return finish(TaskResult::abandoned(spec, reason.into(), attempts(attempt)));
                }
            };

            let score = critique.score();
            if best.as_ref().is_none_or(|(_, best_score)| score >= *best_score) {
                best = Some((output.clone(), score));
            }

            if critique.needs_revision && attempt < max_attempts {
                info!(
                    task_id = %spec.id(),
                    attempt,
                    score,
                    "Self-critique requested revision"
                );
                input = revision_input(&invocation.input, &output, &critique);
                revisions += 1;
                attempt += 1;
                continue;
            }

            let (output, score) = best.take().unwrap_or((output, score));
            return finish(finalized(spec, output, Some(score), attempts(attempt), revisions));
        }
    }

    /// Race a future against the task timeout and the cancellation signal
    ///
    /// On cancellation the future gets the grace period to finish; its
    /// result is discarded either way.
    async fn run_bounded<F: Future>(
        &self,
        fut: F,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Bounded<F::Output> {
        tokio::pin!(fut);

        let first = tokio::select! {
            biased;
            reason = cancel.cancelled() => Err(reason),
            result = tokio::time::timeout(timeout, &mut fut) => Ok(result),
        };

        match first {
            Ok(Ok(output)) => Bounded::Completed(output),
            Ok(Err(_)) => Bounded::TimedOut,
            Err(reason) => {
                if tokio::time::timeout(self.grace_period, &mut fut).await.is_err() {
                    warn!(grace = ?self.grace_period, "Agent ignored cancellation, dropping it");
                }
                Bounded::Cancelled(reason)
            }
        }
    }
}

fn finalized(
    spec: &TaskSpec,
    output: Value,
    score: Option<f64>,
    attempts: u32,
    revisions: u32,
) -> TaskResult {
    let result = TaskResult::succeeded(spec, output, attempts).with_critique_score(score);
    if revisions > 0 { result.revised() } else { result }
}

fn classify_error(err: &Error, cancel: &CancelSignal) -> FailureReason {
    match err {
        Error::AmbiguousOutcome(_) => FailureReason::AmbiguousOutcome,
        Error::Cancelled => cancel
            .reason()
            .map(FailureReason::from)
            .unwrap_or_else(|| FailureReason::AgentFailed(err.to_string())),
        other => FailureReason::AgentFailed(other.to_string()),
    }
}

/// Original input with the critique appended under `critique`
fn revision_input(base: &Value, previous_output: &Value, critique: &Critique) -> Value {
    let feedback = json!({
        "score": critique.score(),
        "feedback": critique.feedback,
        "previous_output": previous_output,
    });

    match base {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("critique".to_string(), feedback);
            Value::Object(map)
        }
        other => json!({ "input": other, "critique": feedback }),
    }
}
