//! Application-level settings shared by binaries

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings errors
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Unknown log level string
    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),
}

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Application name
    pub app_name: String,
    /// Environment (dev, prod, etc.)
    pub environment: String,
    /// Default log level when `RUST_LOG` is not set
    pub log_level: String,
    /// Emit logs as JSON lines
    pub json_logs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "finagent".to_string(),
            environment: "development".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Settings {
    /// Apply `FINAGENT_ENV`, `FINAGENT_LOG` and `FINAGENT_LOG_FORMAT` overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(env) = std::env::var("FINAGENT_ENV") {
            self.environment = env;
        }
        if let Ok(level) = std::env::var("FINAGENT_LOG") {
            self.log_level = level;
        }
        if let Ok(format) = std::env::var("FINAGENT_LOG_FORMAT") {
            self.json_logs = format.eq_ignore_ascii_case("json");
        }
        self
    }

    /// Set the log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enable or disable JSON logs
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), SettingsError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            Ok(())
        } else {
            Err(SettingsError::InvalidLogLevel(self.log_level.clone()))
        }
    }

    /// Whether running in production
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
            || self.environment.eq_ignore_ascii_case("prod")
    }

    /// Whether logs are emitted as JSON lines; always in production
    pub fn json_output(&self) -> bool {
        self.json_logs || self.is_production()
    }
}
