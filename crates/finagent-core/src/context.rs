//! Execution context for agents
//!
//! The `Context` struct carries per-invocation metadata (request, task,
//! attempt, tickers) and the request's cancellation signal.

use crate::cancel::CancelSignal;

/// Context passed to agents during execution
///
/// # Example
///
/// ```
/// use finagent_core::Context;
///
/// let ctx = Context::new()
///     .with_request_id("req-1")
///     .with_task_id("ingest")
///     .with_attempt(2);
///
/// assert_eq!(ctx.request_id(), Some("req-1"));
/// assert_eq!(ctx.attempt(), Some(2));
/// assert!(!ctx.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Context {
    request_id: Option<String>,
    task_id: Option<String>,
    /// 1-based attempt number of the current agent
    attempt: Option<u32>,
    tickers: Vec<String>,
    cancel: CancelSignal,
}

impl Context {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_tickers(mut self, tickers: &[String]) -> Self {
        self.tickers = tickers.to_vec();
        self
    }

    /// Attach the cancellation signal of the owning request
    pub fn with_cancel_signal(mut self, signal: CancelSignal) -> Self {
        self.cancel = signal;
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn attempt(&self) -> Option<u32> {
        self.attempt
    }

    /// Normalized tickers of the owning request
    pub fn tickers(&self) -> &[String] {
        &self.tickers
    }

    /// The request's cancellation signal
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Whether the owning request has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
