//! Orchestrator configuration
//!
//! Configuration is consumed, not owned, by the engine: retry and timeout
//! defaults, per-capability overrides, and fan-out policy flags. It can be
//! built in code, loaded from JSON (`.finagent.json`, camelCase keys,
//! durations in milliseconds) and adjusted from the environment.

use crate::error::{OrchestratorError, Result};
use crate::retry::BackoffPolicy;
use finagent_core::Capability;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the default max retry count
pub const ENV_MAX_RETRIES: &str = "FINAGENT_MAX_RETRIES";
/// Environment variable overriding the default task timeout (milliseconds)
pub const ENV_TASK_TIMEOUT_MS: &str = "FINAGENT_TASK_TIMEOUT_MS";

const PROJECT_CONFIG_FILE: &str = ".finagent.json";

/// Per-capability overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilityConfig {
    /// Max retries for tasks of this capability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Timeout for tasks of this capability
    #[serde(
        rename = "timeoutMs",
        with = "millis_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// Allow several agents to be registered for this capability
    pub fan_out: bool,
}

/// Configuration for the coordination engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Retries per agent when no capability override exists
    pub default_max_retries: u32,

    /// Task timeout when no capability override exists
    #[serde(rename = "defaultTimeoutMs", with = "millis")]
    pub default_timeout: Duration,

    /// Overall deadline applied to requests that do not carry their own
    #[serde(rename = "requestDeadlineMs", with = "millis")]
    pub request_deadline: Duration,

    /// Time an agent gets to exit after cancellation before being dropped
    #[serde(rename = "cancelGracePeriodMs", with = "millis")]
    pub cancel_grace_period: Duration,

    /// Delay between retries
    pub backoff: BackoffPolicy,

    /// Per-capability overrides
    pub capabilities: BTreeMap<Capability, CapabilityConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 2,
            default_timeout: Duration::from_secs(30),
            request_deadline: Duration::from_secs(120),
            cancel_grace_period: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
            capabilities: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Create a new configuration builder
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(OrchestratorError::ConfigError(
                "default timeout must be greater than 0".to_string(),
            ));
        }

        if self.request_deadline.is_zero() {
            return Err(OrchestratorError::ConfigError(
                "request deadline must be greater than 0".to_string(),
            ));
        }

        for (capability, overrides) in &self.capabilities {
            if overrides.timeout.is_some_and(|t| t.is_zero()) {
                return Err(OrchestratorError::ConfigError(format!(
                    "timeout for {capability} must be greater than 0"
                )));
            }
        }

        self.backoff
            .validate()
            .map_err(OrchestratorError::ConfigError)
    }

    /// Effective max retries for a capability
    pub fn max_retries_for(&self, capability: Capability) -> u32 {
        self.capabilities
            .get(&capability)
            .and_then(|c| c.max_retries)
            .unwrap_or(self.default_max_retries)
    }

    /// Effective task timeout for a capability
    pub fn timeout_for(&self, capability: Capability) -> Duration {
        self.capabilities
            .get(&capability)
            .and_then(|c| c.timeout)
            .unwrap_or(self.default_timeout)
    }

    /// Whether fan-out registration is allowed for a capability
    pub fn allows_fan_out(&self, capability: Capability) -> bool {
        self.capabilities
            .get(&capability)
            .is_some_and(|c| c.fan_out)
    }

    /// Capabilities configured for fan-out
    pub fn fan_out_capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities
            .iter()
            .filter(|(_, c)| c.fan_out)
            .map(|(capability, _)| *capability)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_layers([read_layer(path.as_ref())?])
    }

    /// Load merged configuration (user + project)
    ///
    /// Loads `~/.config/finagent/config.json` and layers `.finagent.json`
    /// from the working directory over it. Missing files are skipped.
    pub fn load_merged() -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(path) = user_config_path().filter(|p| p.exists()) {
            layers.push(read_layer(&path)?);
        }

        let project = Path::new(PROJECT_CONFIG_FILE);
        if project.exists() {
            layers.push(read_layer(project)?);
        }

        Self::from_layers(layers)
    }

    /// Build a configuration from raw JSON layers, later layers winning
    ///
    /// Only keys present in a layer override earlier ones; objects such as
    /// `capabilities` and `backoff` are merged key by key. Keys absent from
    /// every layer take their defaults.
    pub fn from_layers(layers: impl IntoIterator<Item = Value>) -> Result<Self> {
        let mut merged = Value::Object(Map::new());
        for layer in layers {
            merge_json(&mut merged, layer);
        }

        let config: OrchestratorConfig = serde_json::from_value(merged).map_err(|e| {
            OrchestratorError::ConfigError(format!("Failed to parse config: {e}"))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `FINAGENT_MAX_RETRIES` and `FINAGENT_TASK_TIMEOUT_MS`
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(ENV_MAX_RETRIES) {
            self.default_max_retries = value.trim().parse().map_err(|e| {
                OrchestratorError::ConfigError(format!("Invalid {ENV_MAX_RETRIES}: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var(ENV_TASK_TIMEOUT_MS) {
            let ms: u64 = value.trim().parse().map_err(|e| {
                OrchestratorError::ConfigError(format!("Invalid {ENV_TASK_TIMEOUT_MS}: {e}"))
            })?;
            self.default_timeout = Duration::from_millis(ms);
        }

        self.validate()?;
        Ok(self)
    }
}

fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        OrchestratorError::ConfigError(format!("Failed to read config file {}: {e}", path.display()))
    })?;

    let layer: Value = serde_json::from_str(&content).map_err(|e| {
        OrchestratorError::ConfigError(format!("Failed to parse config file {}: {e}", path.display()))
    })?;

    if layer.is_object() {
        Ok(layer)
    } else {
        Err(OrchestratorError::ConfigError(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )))
    }
}

/// Recursively merge `overlay` into `base`; non-object values replace
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn user_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok()?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("finagent")
            .join("config.json"),
    )
}

/// Builder for OrchestratorConfig
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    default_max_retries: Option<u32>,
    default_timeout: Option<Duration>,
    request_deadline: Option<Duration>,
    cancel_grace_period: Option<Duration>,
    backoff: Option<BackoffPolicy>,
    capabilities: BTreeMap<Capability, CapabilityConfig>,
}

impl OrchestratorConfigBuilder {
    /// Set default max retries
    pub fn default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = Some(retries);
        self
    }

    /// Set default task timeout
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Set the default request deadline
    pub fn request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = Some(deadline);
        self
    }

    /// Set the cancellation grace period
    pub fn cancel_grace_period(mut self, grace: Duration) -> Self {
        self.cancel_grace_period = Some(grace);
        self
    }

    /// Set the retry backoff policy
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Override max retries for one capability
    pub fn max_retries_for(mut self, capability: Capability, retries: u32) -> Self {
        self.capabilities.entry(capability).or_default().max_retries = Some(retries);
        self
    }

    /// Override the timeout for one capability
    pub fn timeout_for(mut self, capability: Capability, timeout: Duration) -> Self {
        self.capabilities.entry(capability).or_default().timeout = Some(timeout);
        self
    }

    /// Allow fan-out registration for one capability
    pub fn fan_out(mut self, capability: Capability) -> Self {
        self.capabilities.entry(capability).or_default().fan_out = true;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<OrchestratorConfig> {
        let defaults = OrchestratorConfig::default();

        let config = OrchestratorConfig {
            default_max_retries: self
                .default_max_retries
                .unwrap_or(defaults.default_max_retries),
            default_timeout: self.default_timeout.unwrap_or(defaults.default_timeout),
            request_deadline: self.request_deadline.unwrap_or(defaults.request_deadline),
            cancel_grace_period: self
                .cancel_grace_period
                .unwrap_or(defaults.cancel_grace_period),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            capabilities: self.capabilities,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Serialize a `Duration` as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize an `Option<Duration>` as integer milliseconds
pub(crate) mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => super::millis::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
