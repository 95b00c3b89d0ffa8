//! Core abstractions for finagent
//!
//! This crate defines the agent invocation interface shared by the
//! orchestrator and every worker agent: the [`Agent`] trait, the closed set
//! of [`Capability`] tags, self-critique verdicts, and cooperative
//! cancellation.

pub mod agent;
pub mod cancel;
pub mod capability;
pub mod context;
pub mod critique;
pub mod error;

pub use agent::Agent;
pub use cancel::{CancelHandle, CancelReason, CancelSignal};
pub use capability::{Capability, UnknownCapability};
pub use context::Context;
pub use critique::Critique;
pub use error::{Error, Result};
