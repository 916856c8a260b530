//! Router trait and decision types
//!
//! A router classifies a query, plus whatever context signals the caller has,
//! into a [`RoutingDecision`]: which agent should answer, how sure the router is,
//! and a short human-readable reason.
//!
//! Routers keep their own view of the registered agents so they can honour
//! capability preferences and skip rules whose target is not available.

use crate::agent::{AgentDescriptor, Capability};
use crate::error::OrchestratorResult;
use serde::{Deserialize, Serialize};

/// Outcome of classifying one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub selected_agent_id: String,
    /// Always within [0, 1]
    pub confidence: f64,
    pub reasoning: String,
}

impl RoutingDecision {
    pub fn new(agent_id: impl Into<String>, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            selected_agent_id: agent_id.into(),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
        }
    }

    /// Decision for a caller-forced agent, bypassing classification
    pub fn forced(agent_id: impl Into<String>) -> Self {
        Self::new(agent_id, 1.0, "forced by caller")
    }
}

/// Signals beyond the query text that influence routing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingContext {
    pub has_images: bool,
    pub has_audio: bool,
    pub preferred_capability: Option<Capability>,
    /// Recent conversation turns, oldest first
    pub history: Vec<String>,
    /// Agents that must not be selected (used when re-routing after a failure)
    pub excluded_agents: Vec<String>,
}

impl RoutingContext {
    pub fn is_excluded(&self, agent_id: &str) -> bool {
        self.excluded_agents.iter().any(|id| id == agent_id)
    }
}

/// Router contract shared by the heuristic router and classifier-backed routers
#[async_trait::async_trait]
pub trait Router: Send + Sync {
    /// Make an agent known to the router
    fn register_agent(&self, descriptor: AgentDescriptor);

    /// Route using the query and the context signals.
    ///
    /// Only fails with a routing failure when no eligible agent remains.
    async fn route_with_context(
        &self,
        query: &str,
        context: &RoutingContext,
    ) -> OrchestratorResult<RoutingDecision>;

    /// Route on the query text alone
    async fn route(&self, query: &str) -> OrchestratorResult<RoutingDecision> {
        self.route_with_context(query, &RoutingContext::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_confidence_is_clamped() {
        assert_eq!(RoutingDecision::new("a", 1.7, "x").confidence, 1.0);
        assert_eq!(RoutingDecision::new("a", -0.2, "x").confidence, 0.0);
    }

    #[test]
    fn test_forced_decision() {
        let decision = RoutingDecision::forced("code-agent");
        assert_eq!(decision.selected_agent_id, "code-agent");
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn test_exclusion_lookup() {
        let context = RoutingContext {
            excluded_agents: vec!["vision-agent".to_string()],
            ..Default::default()
        };
        assert!(context.is_excluded("vision-agent"));
        assert!(!context.is_excluded("code-agent"));
    }
}
