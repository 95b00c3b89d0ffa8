//! Self-critique verdicts

use serde::{Deserialize, Serialize};

/// An agent's evaluation of its own output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    /// Quality score, always within [0, 1]
    score: f64,
    /// Whether the agent wants another attempt
    pub needs_revision: bool,
    /// Feedback appended to the input of the next attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl Critique {
    /// Create a critique; the score is clamped to [0, 1] and NaN becomes 0
    pub fn new(score: f64, needs_revision: bool) -> Self {
        let score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 1.0)
        };
        Self {
            score,
            needs_revision,
            feedback: None,
        }
    }

    /// An accepting critique with the given score
    pub fn accept(score: f64) -> Self {
        Self::new(score, false)
    }

    /// A critique asking for another attempt
    pub fn revise(score: f64, feedback: impl Into<String>) -> Self {
        Self::new(score, true).with_feedback(feedback)
    }

    /// Attach feedback
    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }

    /// Normalized score
    pub fn score(&self) -> f64 {
        self.score
    }
}
