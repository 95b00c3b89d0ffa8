//! Capability registry
//!
//! Maps each [`Capability`] to the agents that can serve it. The registry is
//! read-mostly: requests take a [`RegistrySnapshot`] and never observe later
//! registrations.

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use finagent_core::{Agent, Capability};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// How a capability accepts additional agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationPolicy {
    /// Only one agent may serve the capability
    Exclusive,
    /// Several agents may serve the capability, tried in registration order
    FanOut,
}

/// A registered agent together with its declared properties
#[derive(Clone)]
pub struct AgentDescriptor {
    capability: Capability,
    agent: Arc<dyn Agent>,
    idempotent: bool,
}

impl AgentDescriptor {
    /// Describe a non-idempotent agent
    pub fn new(capability: Capability, agent: Arc<dyn Agent>) -> Self {
        Self {
            capability,
            agent,
            idempotent: false,
        }
    }

    /// Declare whether re-invocation with the same input is safe
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    pub fn name(&self) -> &str {
        self.agent.name()
    }
}

impl fmt::Debug for AgentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentDescriptor")
            .field("capability", &self.capability)
            .field("agent", &self.agent.name())
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

#[derive(Clone)]
struct Registration {
    policy: RegistrationPolicy,
    agents: Arc<[AgentDescriptor]>,
}

/// Registry of agents keyed by capability
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<Capability, Registration>>,
    fan_out: HashSet<Capability>,
}

impl CapabilityRegistry {
    /// Create an empty registry where every capability is exclusive
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry taking fan-out flags from configuration
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            entries: RwLock::default(),
            fan_out: config.fan_out_capabilities().collect(),
        }
    }

    /// Allow fan-out registration for a capability
    pub fn allow_fan_out(mut self, capability: Capability) -> Self {
        self.fan_out.insert(capability);
        self
    }

    /// Register an agent using the configured policy for its capability
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        let policy = if self.fan_out.contains(&descriptor.capability()) {
            RegistrationPolicy::FanOut
        } else {
            RegistrationPolicy::Exclusive
        };
        self.register_with_policy(descriptor, policy)
    }

    /// Register an agent with an explicit policy
    ///
    /// A second agent for a capability is only accepted when both the
    /// existing and the new registration use [`RegistrationPolicy::FanOut`].
    pub fn register_with_policy(
        &self,
        descriptor: AgentDescriptor,
        policy: RegistrationPolicy,
    ) -> Result<()> {
        let capability = descriptor.capability();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        let agents: Arc<[AgentDescriptor]> = match entries.get(&capability) {
            None => Arc::from(vec![descriptor.clone()]),
            Some(existing)
                if existing.policy == RegistrationPolicy::FanOut
                    && policy == RegistrationPolicy::FanOut =>
            {
                // Copy-on-write: snapshots keep the previous slice
                let mut agents = existing.agents.to_vec();
                agents.push(descriptor.clone());
                Arc::from(agents)
            }
            Some(_) => return Err(OrchestratorError::DuplicateCapability(capability)),
        };

        info!(
            capability = %capability,
            agent = descriptor.name(),
            idempotent = descriptor.is_idempotent(),
            alternates = agents.len(),
            "Registered agent"
        );
        entries.insert(capability, Registration { policy, agents });
        Ok(())
    }

    /// Agents for a capability in registration order
    pub fn resolve(&self, capability: Capability) -> Result<Vec<AgentDescriptor>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&capability)
            .map(|r| r.agents.to_vec())
            .ok_or(OrchestratorError::UnresolvedCapability(capability))
    }

    /// Immutable copy of the current registrations
    pub fn snapshot(&self) -> RegistrySnapshot {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        RegistrySnapshot {
            agents: entries
                .iter()
                .map(|(capability, r)| (*capability, Arc::clone(&r.agents)))
                .collect(),
        }
    }

    /// Registered capabilities in pipeline order
    pub fn capabilities(&self) -> Vec<Capability> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut capabilities: Vec<Capability> = entries.keys().copied().collect();
        capabilities.sort();
        capabilities
    }

    /// Number of capabilities with at least one agent
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registrations captured for the lifetime of one request
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    agents: HashMap<Capability, Arc<[AgentDescriptor]>>,
}

impl RegistrySnapshot {
    /// Agents for a capability in registration order
    pub fn resolve(&self, capability: Capability) -> Result<Arc<[AgentDescriptor]>> {
        self.agents
            .get(&capability)
            .filter(|agents| !agents.is_empty())
            .cloned()
            .ok_or(OrchestratorError::UnresolvedCapability(capability))
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.agents.contains_key(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedAgent;

    fn descriptor(capability: Capability, name: &str) -> AgentDescriptor {
        AgentDescriptor::new(capability, Arc::new(ScriptedAgent::new(name)))
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = CapabilityRegistry::new();
        registry
            .register(descriptor(Capability::Ingest, "ingest").idempotent(true))
            .unwrap();

        let agents = registry.resolve(Capability::Ingest).unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name(), "ingest");
        assert!(agents[0].is_idempotent());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unresolved_capability() {
        let registry = CapabilityRegistry::new();
        let err = registry.resolve(Capability::Decision).unwrap_err();
        assert_eq!(err, OrchestratorError::UnresolvedCapability(Capability::Decision));
        assert!(registry.snapshot().resolve(Capability::Decision).is_err());
    }

    #[test]
    fn test_duplicate_capability_rejected() {
        let registry = CapabilityRegistry::new();
        registry.register(descriptor(Capability::Decision, "a")).unwrap();

        let err = registry
            .register(descriptor(Capability::Decision, "b"))
            .unwrap_err();
        assert_eq!(err, OrchestratorError::DuplicateCapability(Capability::Decision));

        // Explicit fan-out does not override an exclusive registration
        let err = registry
            .register_with_policy(descriptor(Capability::Decision, "c"), RegistrationPolicy::FanOut)
            .unwrap_err();
        assert_eq!(err, OrchestratorError::DuplicateCapability(Capability::Decision));
    }

    #[test]
    fn test_fan_out_keeps_registration_order() {
        let registry = CapabilityRegistry::new().allow_fan_out(Capability::TechnicalAnalysis);
        registry
            .register(descriptor(Capability::TechnicalAnalysis, "primary"))
            .unwrap();
        registry
            .register(descriptor(Capability::TechnicalAnalysis, "backup"))
            .unwrap();

        let names: Vec<String> = registry
            .resolve(Capability::TechnicalAnalysis)
            .unwrap()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["primary", "backup"]);
    }

    #[test]
    fn test_fan_out_from_config() {
        let config = OrchestratorConfig::builder()
            .fan_out(Capability::FundamentalAnalysis)
            .build()
            .unwrap();
        let registry = CapabilityRegistry::from_config(&config);
        registry
            .register(descriptor(Capability::FundamentalAnalysis, "a"))
            .unwrap();
        registry
            .register(descriptor(Capability::FundamentalAnalysis, "b"))
            .unwrap();
        assert_eq!(registry.resolve(Capability::FundamentalAnalysis).unwrap().len(), 2);

        // Capabilities without a fan-out flag stay exclusive
        registry.register(descriptor(Capability::Decision, "a")).unwrap();
        let err = registry
            .register(descriptor(Capability::Decision, "b"))
            .unwrap_err();
        assert_eq!(err, OrchestratorError::DuplicateCapability(Capability::Decision));
    }

    #[test]
    fn test_snapshot_unaffected_by_later_registration() {
        let registry = CapabilityRegistry::new().allow_fan_out(Capability::Monitor);
        registry.register(descriptor(Capability::Monitor, "first")).unwrap();

        let snapshot = registry.snapshot();

        registry.register(descriptor(Capability::Monitor, "second")).unwrap();
        registry.register(descriptor(Capability::Ingest, "ingest")).unwrap();

        assert_eq!(snapshot.resolve(Capability::Monitor).unwrap().len(), 1);
        assert!(!snapshot.contains(Capability::Ingest));
        assert_eq!(registry.resolve(Capability::Monitor).unwrap().len(), 2);
        assert_eq!(
            registry.capabilities(),
            vec![Capability::Ingest, Capability::Monitor]
        );
    }
}
