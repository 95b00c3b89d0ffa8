//! Scripted agents and fixtures for orchestrator tests

use crate::config::OrchestratorConfig;
use crate::registry::{AgentDescriptor, CapabilityRegistry};
use crate::retry::BackoffPolicy;
use async_trait::async_trait;
use finagent_core::{Agent, Capability, Context, Critique, Error, Result};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One scripted reaction to `execute`
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Succeed(Value),
    Fail(String),
    Ambiguous,
    /// Sleep, then succeed with the value
    Sleep(Duration, Value),
    /// Wait for cancellation, then return `Error::Cancelled`
    Hang,
    /// Never return, even when cancelled
    Stubborn,
}

/// One scripted reaction to `critique`
#[derive(Debug, Clone)]
pub(crate) enum CritiqueStep {
    Verdict(Critique),
    Fail,
}

/// Agent replaying a script and recording how it was called
pub(crate) struct ScriptedAgent {
    name: String,
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    critique_enabled: bool,
    critiques: Mutex<VecDeque<CritiqueStep>>,
    critique_fallback: CritiqueStep,
    executions: AtomicU32,
    critique_calls: AtomicU32,
    inputs: Mutex<Vec<Value>>,
    attempts_seen: Mutex<Vec<u32>>,
}

impl ScriptedAgent {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Mutex::new(VecDeque::new()),
            fallback: Step::Succeed(json!({ "agent": name })),
            critique_enabled: false,
            critiques: Mutex::new(VecDeque::new()),
            critique_fallback: CritiqueStep::Verdict(Critique::accept(1.0)),
            executions: AtomicU32::new(0),
            critique_calls: AtomicU32::new(0),
            inputs: Mutex::new(Vec::new()),
            attempts_seen: Mutex::new(Vec::new()),
        }
    }

    /// Queue a step for the next unscripted execution
    pub(crate) fn then(self, step: Step) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    /// Step used once the queue is empty
    pub(crate) fn otherwise(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    /// Enable self-critique with queued verdicts
    pub(crate) fn with_critiques(mut self, steps: impl IntoIterator<Item = CritiqueStep>) -> Self {
        self.critique_enabled = true;
        self.critiques.lock().unwrap().extend(steps);
        self
    }

    /// Verdict used once the critique queue is empty
    pub(crate) fn critique_otherwise(mut self, step: CritiqueStep) -> Self {
        self.critique_enabled = true;
        self.critique_fallback = step;
        self
    }

    pub(crate) fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    pub(crate) fn critique_calls(&self) -> u32 {
        self.critique_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap().clone()
    }

    pub(crate) fn attempts_seen(&self) -> Vec<u32> {
        self.attempts_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn execute(&self, input: Value, context: &Context) -> Result<Value> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input);
        if let Some(attempt) = context.attempt() {
            self.attempts_seen.lock().unwrap().push(attempt);
        }

        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Succeed(value) => Ok(value),
            Step::Fail(message) => Err(Error::ProcessingFailed(message)),
            Step::Ambiguous => Err(Error::AmbiguousOutcome("connection reset".to_string())),
            Step::Sleep(duration, value) => {
                tokio::time::sleep(duration).await;
                Ok(value)
            }
            Step::Hang => {
                context.cancel_signal().cancelled().await;
                Err(Error::Cancelled)
            }
            Step::Stubborn => Ok(std::future::pending::<Value>().await),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supports_critique(&self) -> bool {
        self.critique_enabled
    }

    async fn critique(&self, _input: &Value, _output: &Value, _context: &Context) -> Result<Critique> {
        self.critique_calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .critiques
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.critique_fallback.clone());

        match step {
            CritiqueStep::Verdict(critique) => Ok(critique),
            CritiqueStep::Fail => Err(Error::ProcessingFailed("critique model unavailable".into())),
        }
    }
}

/// Short timeouts and backoff for engine tests
pub(crate) fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::builder()
        .default_max_retries(2)
        .default_timeout(Duration::from_millis(200))
        .request_deadline(Duration::from_secs(5))
        .cancel_grace_period(Duration::from_millis(50))
        .backoff(BackoffPolicy::fast())
        .build()
        .unwrap()
}

/// Scripted agents for every capability of the pipeline
pub(crate) struct Pipeline {
    agents: Vec<(Capability, Arc<ScriptedAgent>)>,
    non_idempotent: Vec<Capability>,
}

impl Pipeline {
    /// Default agents that succeed immediately
    pub(crate) fn new() -> Self {
        Self {
            agents: Capability::ALL
                .iter()
                .map(|&c| (c, Arc::new(ScriptedAgent::new(c.as_str()))))
                .collect(),
            non_idempotent: Vec::new(),
        }
    }

    /// Register the agent for a capability as non-idempotent
    pub(crate) fn non_idempotent(mut self, capability: Capability) -> Self {
        self.non_idempotent.push(capability);
        self
    }

    /// Replace the agent for a capability
    pub(crate) fn with(mut self, capability: Capability, agent: ScriptedAgent) -> Self {
        let agent = Arc::new(agent);
        if let Some(slot) = self.agents.iter_mut().find(|(c, _)| *c == capability) {
            slot.1 = agent;
        }
        self
    }

    pub(crate) fn agent(&self, capability: Capability) -> Arc<ScriptedAgent> {
        self.agents
            .iter()
            .find(|(c, _)| *c == capability)
            .map(|(_, a)| Arc::clone(a))
            .unwrap()
    }

    /// Register every agent, idempotent unless marked otherwise
    pub(crate) fn registry(&self) -> CapabilityRegistry {
        let registry = CapabilityRegistry::new();
        for (capability, agent) in &self.agents {
            let agent: Arc<dyn Agent> = agent.clone();
            let idempotent = !self.non_idempotent.contains(capability);
            registry
                .register(AgentDescriptor::new(*capability, agent).idempotent(idempotent))
                .unwrap();
        }
        registry
    }
}
