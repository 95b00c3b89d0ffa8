//! Core Agent trait definition

use crate::{Context, Critique, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Invocation interface every worker agent implements
///
/// Inputs and outputs are opaque JSON payloads; the orchestration layer never
/// inspects them beyond merging upstream outputs into the input.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Execute the agent against a task input
    ///
    /// Long-running agents should watch `context.cancel_signal()` and return
    /// [`crate::Error::Cancelled`] promptly once it fires.
    async fn execute(&self, input: Value, context: &Context) -> Result<Value>;

    /// Get the agent's name
    fn name(&self) -> &str;

    /// Whether [`Agent::critique`] performs a real evaluation
    fn supports_critique(&self) -> bool {
        false
    }

    /// Evaluate an output produced for `input`
    ///
    /// The default accepts every output with a perfect score.
    async fn critique(&self, _input: &Value, _output: &Value, _context: &Context) -> Result<Critique> {
        Ok(Critique::accept(1.0))
    }
}
