//! Agent registry
//!
//! Thread-safe catalogue of every agent the engine may route to, keyed by id.
//! Registration order is preserved because capability lookups return the
//! first-registered match.

use super::{AgentDescriptor, AgentFactory, Capability};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A registered agent: its descriptor and how to build fresh instances
#[derive(Clone)]
pub struct RegisteredAgent {
    pub descriptor: AgentDescriptor,
    pub factory: AgentFactory,
    pub registered_at: DateTime<Utc>,
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<String, RegisteredAgent>,
    order: Vec<String>,
}

/// Shared registry; clones refer to the same catalogue
#[derive(Clone, Default)]
pub struct AgentRegistry {
    entries: Arc<RwLock<Entries>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an agent. Replacing keeps its original position.
    pub fn register(&self, descriptor: AgentDescriptor, factory: AgentFactory) {
        let id = descriptor.id.clone();
        let mut entries = self.entries.write();

        let entry = RegisteredAgent {
            descriptor,
            factory,
            registered_at: Utc::now(),
        };

        if entries.by_id.insert(id.clone(), entry).is_some() {
            warn!(agent_id = %id, "Replaced existing agent registration");
        } else {
            entries.order.push(id.clone());
            info!(agent_id = %id, total_agents = entries.order.len(), "Registered agent");
        }
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        let mut entries = self.entries.write();
        if entries.by_id.remove(agent_id).is_some() {
            entries.order.retain(|id| id != agent_id);
            debug!(agent_id = %agent_id, "Unregistered agent");
            true
        } else {
            false
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<RegisteredAgent> {
        self.entries.read().by_id.get(agent_id).cloned()
    }

    pub fn descriptor(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.entries
            .read()
            .by_id
            .get(agent_id)
            .map(|e| e.descriptor.clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.entries.read().by_id.contains_key(agent_id)
    }

    /// Agent ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.entries.read().order.clone()
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> Vec<AgentDescriptor> {
        let entries = self.entries.read();
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id))
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Agents advertising `capability`, in registration order
    pub fn find_with_capability(&self, capability: Capability) -> Vec<AgentDescriptor> {
        self.descriptors()
            .into_iter()
            .filter(|d| d.has_capability(capability))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockAgentSpec;

    fn register(registry: &AgentRegistry, spec: MockAgentSpec) {
        registry.register(spec.descriptor(), spec.factory());
    }

    #[test]
    fn test_register_and_get() {
        let registry = AgentRegistry::new();
        register(&registry, MockAgentSpec::new("code-agent"));

        assert!(registry.contains("code-agent"));
        assert!(registry.get("code-agent").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capability_lookup_preserves_registration_order() {
        let registry = AgentRegistry::new();
        register(
            &registry,
            MockAgentSpec::new("b-vision").with_capabilities([Capability::Vision]),
        );
        register(
            &registry,
            MockAgentSpec::new("a-vision").with_capabilities([Capability::Vision]),
        );
        register(
            &registry,
            MockAgentSpec::new("code").with_capabilities([Capability::CodeGeneration]),
        );

        let found: Vec<_> = registry
            .find_with_capability(Capability::Vision)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(found, vec!["b-vision", "a-vision"]);
    }

    #[test]
    fn test_replacing_keeps_position() {
        let registry = AgentRegistry::new();
        register(&registry, MockAgentSpec::new("first"));
        register(&registry, MockAgentSpec::new("second"));
        register(&registry, MockAgentSpec::new("first").with_cost(42));

        assert_eq!(registry.ids(), vec!["first", "second"]);
        assert_eq!(registry.descriptor("first").unwrap().resource_cost_mb, 42);
    }

    #[test]
    fn test_unregister() {
        let registry = AgentRegistry::new();
        register(&registry, MockAgentSpec::new("gone"));

        assert!(registry.unregister("gone"));
        assert!(!registry.unregister("gone"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = AgentRegistry::new();
        let clone = registry.clone();
        register(&clone, MockAgentSpec::new("shared"));

        assert!(registry.contains("shared"));
    }
}
