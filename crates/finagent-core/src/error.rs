//! Error types for finagent-core

use thiserror::Error;

/// Result type alias for agent calls
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for agent operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Generic error message
    #[error("{0}")]
    Generic(String),

    /// Agent initialization failed
    #[error("Agent initialization failed: {0}")]
    InitializationFailed(String),

    /// Agent processing failed; the call definitely did not complete
    #[error("Agent processing failed: {0}")]
    ProcessingFailed(String),

    /// The call may or may not have completed (e.g. connection dropped
    /// after the request was sent)
    #[error("Ambiguous outcome: {0}")]
    AmbiguousOutcome(String),

    /// The agent stopped because it observed cancellation
    #[error("Agent cancelled")]
    Cancelled,
}

impl Error {
    /// Whether completion status of the failed call is unknown
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::AmbiguousOutcome(_))
    }
}
