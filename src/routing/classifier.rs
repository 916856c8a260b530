//! Classifier-backed routing
//!
//! [`ClassifierRouter`] asks a pluggable [`IntentClassifier`] (for example a small
//! embedding or language model) which capability a query needs, then picks the
//! first registered agent advertising it. Whenever the backend is unavailable,
//! errors, answers below the confidence floor, or names a capability nobody
//! provides, the decision comes from the wrapped [`HeuristicRouter`] instead, so
//! routing never hard-fails because of the classifier.

use super::heuristic::HeuristicRouter;
use super::router::{Router, RoutingContext, RoutingDecision};
use crate::agent::{AgentDescriptor, Capability};
use crate::error::OrchestratorResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub capability: Capability,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClassifierError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),
    #[error("Classification failed: {0}")]
    Failed(String),
}

/// Backend that maps a query to the capability it needs
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    /// Cheap readiness probe; an unavailable classifier is never called
    fn is_available(&self) -> bool {
        true
    }

    async fn classify(
        &self,
        query: &str,
        context: &RoutingContext,
    ) -> Result<Classification, ClassifierError>;
}

pub struct ClassifierRouter {
    classifier: Arc<dyn IntentClassifier>,
    heuristic: HeuristicRouter,
    agents: RwLock<Vec<AgentDescriptor>>,
    min_confidence: f64,
}

impl ClassifierRouter {
    pub fn new(classifier: Arc<dyn IntentClassifier>, heuristic: HeuristicRouter) -> Self {
        Self {
            classifier,
            heuristic,
            agents: RwLock::new(Vec::new()),
            min_confidence: 0.5,
        }
    }

    /// Classifications below this confidence defer to the heuristic
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    fn provider_for(&self, capability: Capability, context: &RoutingContext) -> Option<String> {
        self.agents
            .read()
            .iter()
            .find(|d| d.has_capability(capability) && !context.is_excluded(&d.id))
            .map(|d| d.id.clone())
    }
}

#[async_trait]
impl Router for ClassifierRouter {
    fn register_agent(&self, descriptor: AgentDescriptor) {
        {
            let mut agents = self.agents.write();
            match agents.iter_mut().find(|d| d.id == descriptor.id) {
                Some(existing) => *existing = descriptor.clone(),
                None => agents.push(descriptor.clone()),
            }
        }
        self.heuristic.register_agent(descriptor);
    }

    async fn route_with_context(
        &self,
        query: &str,
        context: &RoutingContext,
    ) -> OrchestratorResult<RoutingDecision> {
        // Attachments and explicit preferences are decided the same way for every router
        if context.has_images || context.has_audio || context.preferred_capability.is_some() {
            return self.heuristic.decide(query, context);
        }

        if !self.classifier.is_available() {
            debug!("Intent classifier unavailable, using heuristic routing");
            return self.heuristic.decide(query, context);
        }

        match self.classifier.classify(query, context).await {
            Ok(c) if c.confidence >= self.min_confidence => {
                if let Some(agent_id) = self.provider_for(c.capability, context) {
                    return Ok(RoutingDecision::new(
                        agent_id,
                        c.confidence,
                        format!("classifier: {} ({})", c.reasoning, c.capability),
                    ));
                }
                debug!(capability = %c.capability, "No agent provides classified capability");
            }
            Ok(c) => {
                debug!(
                    confidence = c.confidence,
                    min_confidence = self.min_confidence,
                    "Classification below confidence floor"
                );
            }
            Err(e) => {
                warn!(error = %e, "Intent classifier failed, using heuristic routing");
            }
        }

        self.heuristic.decide(query, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingSection;
    use crate::testing::mocks::MockClassifier;

    fn router(classifier: MockClassifier) -> (ClassifierRouter, Arc<MockClassifier>) {
        let classifier = Arc::new(classifier);
        let router = ClassifierRouter::new(
            classifier.clone(),
            HeuristicRouter::new(RoutingSection::default()),
        );
        router.register_agent(
            AgentDescriptor::new("conversation-agent", "c")
                .with_capabilities([Capability::Conversation]),
        );
        router.register_agent(
            AgentDescriptor::new("logical-agent", "l")
                .with_capabilities([Capability::LogicalAnalysis]),
        );
        router.register_agent(
            AgentDescriptor::new("code-agent", "code")
                .with_capabilities([Capability::CodeGeneration]),
        );
        (router, classifier)
    }

    #[tokio::test]
    async fn test_confident_classification_wins() {
        let (router, _) = router(MockClassifier::returning(Capability::LogicalAnalysis, 0.8));
        let decision = router.route("write some python code").await.unwrap();
        assert_eq!(decision.selected_agent_id, "logical-agent");
        assert_eq!(decision.confidence, 0.8);
        assert!(decision.reasoning.starts_with("classifier"));
    }

    #[tokio::test]
    async fn test_low_confidence_defers_to_heuristic() {
        let (router, _) = router(MockClassifier::returning(Capability::LogicalAnalysis, 0.2));
        let decision = router.route("write some python code").await.unwrap();
        assert_eq!(decision.selected_agent_id, "code-agent");
    }

    #[tokio::test]
    async fn test_failing_backend_degrades_to_heuristic() {
        let (router, classifier) = router(MockClassifier::failing());
        let decision = router.route("").await.unwrap();
        assert_eq!(decision.selected_agent_id, "conversation-agent");
        assert!(decision.reasoning.contains("default"));
        assert_eq!(classifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_not_called() {
        let (router, classifier) = router(MockClassifier::unavailable());
        router.route("python").await.unwrap();
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_unprovided_capability_defers_to_heuristic() {
        let (router, _) = router(MockClassifier::returning(Capability::Vision, 0.99));
        let decision = router.route("python").await.unwrap();
        assert_eq!(decision.selected_agent_id, "code-agent");
    }

    #[tokio::test]
    async fn test_images_bypass_classifier() {
        let (router, classifier) = router(MockClassifier::returning(Capability::Conversation, 0.9));
        let context = RoutingContext {
            has_images: true,
            has_audio: true,
            ..Default::default()
        };
        let decision = router.route_with_context("hi", &context).await.unwrap();
        assert_eq!(decision.selected_agent_id, "vision-agent");
        assert_eq!(classifier.calls(), 0);
    }
}
