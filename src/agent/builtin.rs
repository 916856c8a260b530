//! Built-in simulated agents
//!
//! These stand in for real inference backends so the binary can run end to end.
//! Each preset advertises the capabilities and memory cost of the backend it
//! models and answers with a short templated reply.

use super::{
    Agent, AgentDescriptor, AgentError, AgentFactory, AgentInput, AgentOutput, AgentResult,
    AgentState, BackendHandle, Capability,
};
use crate::progress::{LoadPhase, ProgressSender};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    Conversation,
    Code,
    Vision,
    Logical,
    Multilingual,
    Speech,
}

/// State the simulated backend keeps while loaded
struct SimulatedBackend {
    model: String,
    loaded_at: Instant,
}

pub struct SimulatedAgent {
    descriptor: AgentDescriptor,
    persona: Persona,
    load_delay: Duration,
    state: Mutex<AgentState>,
    backend: Mutex<Option<BackendHandle>>,
}

impl SimulatedAgent {
    pub fn new(descriptor: AgentDescriptor, persona: Persona) -> Self {
        Self {
            descriptor,
            persona,
            load_delay: Duration::from_millis(50),
            state: Mutex::new(AgentState::Unloaded),
            backend: Mutex::new(None),
        }
    }

    fn reply(&self, input: &AgentInput, model: &str) -> AgentOutput {
        let content = input.content.trim();
        match self.persona {
            Persona::Speech => {
                let text = input
                    .audio
                    .as_ref()
                    .map(|a| String::from_utf8_lossy(&a.data).trim().to_string())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| content.to_string());
                AgentOutput::transcription(&self.descriptor.id, text)
            }
            Persona::Vision => AgentOutput::text(
                &self.descriptor.id,
                format!(
                    "[{model}] Looked at {} image(s): {content}",
                    input.images.len()
                ),
            ),
            Persona::Code => AgentOutput::text(
                &self.descriptor.id,
                format!("[{model}] Here is a starting point for: {content}"),
            ),
            Persona::Logical => AgentOutput::text(
                &self.descriptor.id,
                format!("[{model}] Step by step: {content}"),
            ),
            Persona::Multilingual => AgentOutput::text(
                &self.descriptor.id,
                format!("[{model}] Translation requested: {content}"),
            ),
            Persona::Conversation => AgentOutput::text(
                &self.descriptor.id,
                format!("[{model}] {content}"),
            ),
        }
    }
}

#[async_trait]
impl Agent for SimulatedAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    fn state(&self) -> AgentState {
        *self.state.lock()
    }

    async fn load(&self, progress: &ProgressSender) -> AgentResult<()> {
        *self.state.lock() = AgentState::Loading;
        progress.report(LoadPhase::Downloading, 0.3, "fetching weights");
        tokio::time::sleep(self.load_delay / 2).await;
        progress.report(LoadPhase::Initializing, 0.8, "warming up");
        tokio::time::sleep(self.load_delay / 2).await;

        let backend = SimulatedBackend {
            model: format!("{}-sim", self.descriptor.id),
            loaded_at: Instant::now(),
        };
        *self.backend.lock() = Some(Box::new(backend));
        *self.state.lock() = AgentState::Ready;
        debug!(agent_id = %self.descriptor.id, "Simulated backend ready");
        Ok(())
    }

    async fn unload(&self) -> AgentResult<()> {
        self.backend.lock().take();
        *self.state.lock() = AgentState::Unloaded;
        Ok(())
    }

    async fn process(&self, input: AgentInput) -> AgentResult<AgentOutput> {
        let started = Instant::now();
        let model = {
            let backend = self.backend.lock();
            let Some(sim) = backend
                .as_ref()
                .and_then(|b| b.downcast_ref::<SimulatedBackend>())
            else {
                return Err(AgentError::NotReady {
                    agent_id: self.descriptor.id.clone(),
                    state: self.state(),
                });
            };
            debug!(
                agent_id = %self.descriptor.id,
                resident_ms = sim.loaded_at.elapsed().as_millis() as u64,
                "Processing on simulated backend"
            );
            sim.model.clone()
        };

        *self.state.lock() = AgentState::Busy;
        let mut output = self.reply(&input, &model);
        *self.state.lock() = AgentState::Ready;

        output.confidence = 0.9;
        output.processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(output)
    }
}

fn preset(
    id: &str,
    name: &str,
    capabilities: &[Capability],
    cost_mb: u64,
    priority: u8,
    persona: Persona,
) -> (AgentDescriptor, AgentFactory) {
    let descriptor = AgentDescriptor::new(id, name)
        .with_capabilities(capabilities.iter().copied())
        .with_cost(cost_mb)
        .with_priority(priority);
    let template = descriptor.clone();
    let factory: AgentFactory = Arc::new(move || -> Box<dyn Agent> {
        Box::new(SimulatedAgent::new(template.clone(), persona))
    });
    (descriptor, factory)
}

/// The default agent roster: one simulated agent per routing target
pub fn builtin_agents() -> Vec<(AgentDescriptor, AgentFactory)> {
    vec![
        preset(
            "conversation-agent",
            "Conversation",
            &[Capability::Conversation, Capability::CreativeWriting],
            2000,
            5,
            Persona::Conversation,
        ),
        preset(
            "code-agent",
            "Code",
            &[Capability::CodeGeneration, Capability::CodeExplanation],
            3000,
            8,
            Persona::Code,
        ),
        preset(
            "vision-agent",
            "Vision",
            &[Capability::Vision, Capability::ImageAnalysis],
            4000,
            9,
            Persona::Vision,
        ),
        preset(
            "logical-agent",
            "Logic",
            &[Capability::LogicalAnalysis],
            2500,
            7,
            Persona::Logical,
        ),
        preset(
            "multilingual-agent",
            "Multilingual",
            &[Capability::Multilingual],
            2000,
            6,
            Persona::Multilingual,
        ),
        preset(
            "speech-to-text-agent",
            "Speech",
            &[Capability::SpeechRecognition],
            1000,
            9,
            Persona::Speech,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Attachment, OutputKind};

    fn agent(id: &str) -> Box<dyn Agent> {
        let (_, factory) = builtin_agents()
            .into_iter()
            .find(|(d, _)| d.id == id)
            .unwrap();
        factory()
    }

    #[tokio::test]
    async fn test_process_before_load_is_not_ready() {
        let agent = agent("code-agent");
        let result = agent.process(AgentInput::text("hi")).await;
        assert!(matches!(result, Err(AgentError::NotReady { .. })));
    }

    #[tokio::test]
    async fn test_load_process_unload_cycle() {
        let agent = agent("conversation-agent");
        agent.load(&ProgressSender::noop("conversation-agent")).await.unwrap();
        assert_eq!(agent.state(), AgentState::Ready);

        let output = agent.process(AgentInput::text("bonjour")).await.unwrap();
        assert_eq!(output.agent_id, "conversation-agent");
        assert!(output.content.contains("bonjour"));

        agent.unload().await.unwrap();
        assert_eq!(agent.state(), AgentState::Unloaded);
    }

    #[tokio::test]
    async fn test_speech_agent_transcribes_audio() {
        let agent = agent("speech-to-text-agent");
        agent.load(&ProgressSender::noop("speech")).await.unwrap();

        let input = AgentInput {
            audio: Some(Attachment::new("audio/wav", b"write a python function".to_vec())),
            ..Default::default()
        };
        let output = agent.process(input).await.unwrap();
        assert_eq!(output.kind, OutputKind::Transcription);
        assert_eq!(output.content, "write a python function");
    }

    #[test]
    fn test_roster_ids_are_unique() {
        let mut ids: Vec<_> = builtin_agents().into_iter().map(|(d, _)| d.id).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }
}
