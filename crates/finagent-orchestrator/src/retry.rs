//! Exponential backoff between task retries

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy applied by the engine before re-running a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    #[serde(rename = "initialBackoffMs", with = "crate::config::millis")]
    pub initial_backoff: Duration,

    /// Upper bound on any single delay
    #[serde(rename = "maxBackoffMs", with = "crate::config::millis")]
    pub max_backoff: Duration,

    /// Backoff multiplier (typically 2.0 for exponential backoff)
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_backoff: Duration, max_backoff: Duration, multiplier: f64) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            multiplier,
        }
    }

    /// Retry immediately
    pub fn none() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Create a policy with fast retries (for testing)
    pub fn fast() -> Self {
        Self {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `retry` (1-based); zero for `retry == 0`
    pub fn backoff_duration(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let backoff_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);

        // Cap at max backoff; also covers overflow to infinity
        let max_ms = self.max_backoff.as_millis() as f64;
        if !backoff_ms.is_finite() || backoff_ms > max_ms {
            self.max_backoff
        } else {
            Duration::from_millis(backoff_ms as u64)
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.multiplier
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err("initial backoff must not exceed max backoff".to_string());
        }
        Ok(())
    }
}
