//! Composite agents
//!
//! A [`CompositeAgent`] pairs two agents behind a single descriptor. The pair is
//! loaded, cached and evicted as one unit; the [`CombineStrategy`] decides how
//! the two inner agents share a request.

use super::{
    Agent, AgentDescriptor, AgentError, AgentInput, AgentKind, AgentOutput, AgentResult,
    AgentState,
};
use crate::progress::ProgressSender;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineStrategy {
    /// Use the secondary only when the primary fails
    Fallback,
    /// Feed the primary's answer to the secondary as its input
    Pipeline,
    /// Run both and join their answers
    Merge,
}

pub struct CompositeAgent {
    descriptor: AgentDescriptor,
    primary: Box<dyn Agent>,
    secondary: Box<dyn Agent>,
    strategy: CombineStrategy,
}

impl CompositeAgent {
    /// Combine two agents. Capabilities are the union, cost the sum and
    /// priority the higher of the two.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        primary: Box<dyn Agent>,
        secondary: Box<dyn Agent>,
        strategy: CombineStrategy,
    ) -> Self {
        let p = primary.descriptor();
        let s = secondary.descriptor();

        let mut capabilities = p.capabilities.clone();
        for capability in &s.capabilities {
            if !capabilities.contains(capability) {
                capabilities.push(*capability);
            }
        }

        let descriptor = AgentDescriptor {
            id: id.into(),
            name: name.into(),
            capabilities,
            resource_cost_mb: p.resource_cost_mb + s.resource_cost_mb,
            priority: p.priority.max(s.priority),
        };

        Self {
            descriptor,
            primary,
            secondary,
            strategy,
        }
    }

    fn finish(&self, mut output: AgentOutput, started: Instant) -> AgentOutput {
        output.agent_id = self.descriptor.id.clone();
        output.processing_time_ms = started.elapsed().as_millis() as u64;
        output
    }
}

#[async_trait]
impl Agent for CompositeAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn state(&self) -> AgentState {
        use AgentState::*;
        match (self.primary.state(), self.secondary.state()) {
            (Error, _) | (_, Error) => Error,
            (Loading, _) | (_, Loading) => Loading,
            (Busy, _) | (_, Busy) => Busy,
            (Ready, Ready) => Ready,
            _ => Unloaded,
        }
    }

    fn kind(&self) -> AgentKind {
        AgentKind::Composite {
            primary: self.primary.id().to_string(),
            secondary: self.secondary.id().to_string(),
            strategy: self.strategy,
        }
    }

    async fn load(&self, progress: &ProgressSender) -> AgentResult<()> {
        self.primary.load(progress).await?;

        if let Err(e) = self.secondary.load(progress).await {
            // Roll back so a failed composite never leaves half of itself resident
            if let Err(unload_err) = self.primary.unload().await {
                warn!(
                    agent_id = %self.descriptor.id,
                    error = %unload_err,
                    "Failed to roll back primary after secondary load failure"
                );
            }
            return Err(e);
        }

        debug!(agent_id = %self.descriptor.id, "Composite agent loaded");
        Ok(())
    }

    async fn unload(&self) -> AgentResult<()> {
        let primary = self.primary.unload().await;
        let secondary = self.secondary.unload().await;
        primary.and(secondary)
    }

    async fn process(&self, input: AgentInput) -> AgentResult<AgentOutput> {
        let started = Instant::now();

        match self.strategy {
            CombineStrategy::Fallback => match self.primary.process(input.clone()).await {
                Ok(output) => Ok(self.finish(output, started)),
                Err(e) => {
                    debug!(
                        agent_id = %self.descriptor.id,
                        error = %e,
                        "Primary failed, using secondary"
                    );
                    let output = self.secondary.process(input).await?;
                    Ok(self.finish(output, started))
                }
            },
            CombineStrategy::Pipeline => {
                let intermediate = self.primary.process(input.clone()).await?;
                let next = AgentInput {
                    content: intermediate.content,
                    ..input
                };
                let output = self.secondary.process(next).await?;
                Ok(self.finish(output, started))
            }
            CombineStrategy::Merge => {
                let (first, second) = tokio::join!(
                    self.primary.process(input.clone()),
                    self.secondary.process(input)
                );
                let merged = match (first, second) {
                    (Ok(a), Ok(b)) => AgentOutput {
                        content: format!("{}\n\n{}", a.content, b.content),
                        confidence: (a.confidence + b.confidence) / 2.0,
                        ..a
                    },
                    (Ok(only), Err(e)) | (Err(e), Ok(only)) => {
                        warn!(
                            agent_id = %self.descriptor.id,
                            error = %e,
                            "One side of merge failed"
                        );
                        only
                    }
                    (Err(e), Err(_)) => {
                        return Err(AgentError::processing_failed(format!(
                            "both agents failed: {e}"
                        )))
                    }
                };
                Ok(self.finish(merged, started))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Capability;
    use crate::testing::mocks::MockAgentSpec;

    fn pair(
        strategy: CombineStrategy,
        primary: MockAgentSpec,
        secondary: MockAgentSpec,
    ) -> CompositeAgent {
        CompositeAgent::new(
            "hybrid-agent",
            "Hybrid",
            Box::new(primary.build()),
            Box::new(secondary.build()),
            strategy,
        )
    }

    #[test]
    fn test_descriptor_combines_inner_agents() {
        let composite = pair(
            CombineStrategy::Fallback,
            MockAgentSpec::new("code-agent")
                .with_capabilities([Capability::CodeGeneration])
                .with_cost(1000)
                .with_priority(3),
            MockAgentSpec::new("logical-agent")
                .with_capabilities([Capability::LogicalAnalysis, Capability::CodeGeneration])
                .with_cost(500)
                .with_priority(7),
        );

        let d = composite.descriptor();
        assert_eq!(d.resource_cost_mb, 1500);
        assert_eq!(d.priority, 7);
        assert_eq!(
            d.capabilities,
            vec![Capability::CodeGeneration, Capability::LogicalAnalysis]
        );
        assert!(matches!(
            composite.kind(),
            AgentKind::Composite {
                strategy: CombineStrategy::Fallback,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fallback_uses_secondary_on_failure() {
        let composite = pair(
            CombineStrategy::Fallback,
            MockAgentSpec::new("a").failing_process(),
            MockAgentSpec::new("b").with_response("from b"),
        );
        composite.load(&ProgressSender::noop("hybrid-agent")).await.unwrap();

        let output = composite.process(AgentInput::text("hi")).await.unwrap();
        assert_eq!(output.content, "from b");
        assert_eq!(output.agent_id, "hybrid-agent");
    }

    #[tokio::test]
    async fn test_pipeline_feeds_primary_output_forward() {
        let composite = pair(
            CombineStrategy::Pipeline,
            MockAgentSpec::new("a").with_response("draft"),
            MockAgentSpec::new("b").echoing(),
        );
        composite.load(&ProgressSender::noop("hybrid-agent")).await.unwrap();

        let output = composite.process(AgentInput::text("hi")).await.unwrap();
        assert_eq!(output.content, "b: draft");
    }

    #[tokio::test]
    async fn test_merge_joins_both_answers() {
        let composite = pair(
            CombineStrategy::Merge,
            MockAgentSpec::new("a").with_response("left"),
            MockAgentSpec::new("b").with_response("right"),
        );
        composite.load(&ProgressSender::noop("hybrid-agent")).await.unwrap();

        let output = composite.process(AgentInput::text("hi")).await.unwrap();
        assert_eq!(output.content, "left\n\nright");
    }

    #[tokio::test]
    async fn test_secondary_load_failure_rolls_back_primary() {
        let primary = MockAgentSpec::new("a");
        let counters = primary.counters();
        let composite = pair(
            CombineStrategy::Fallback,
            primary,
            MockAgentSpec::new("b").failing_load(),
        );

        let result = composite.load(&ProgressSender::noop("hybrid-agent")).await;
        assert!(result.is_err());
        assert_eq!(counters.loads(), 1);
        assert_eq!(counters.unloads(), 1);
    }
}
