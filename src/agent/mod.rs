//! Agent contract and shared agent data types
//!
//! An agent wraps one heavyweight inference backend. The orchestration core only
//! sees the [`Agent`] trait and the static [`AgentDescriptor`]; whatever engine
//! the agent drives stays behind an opaque [`BackendHandle`].

pub mod builtin;
pub mod composite;
pub mod registry;

use crate::engine::lifecycle::PhaseTimings;
use crate::progress::ProgressSender;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use composite::{CombineStrategy, CompositeAgent};
pub use registry::{AgentRegistry, RegisteredAgent};

/// What an agent is able to do; used by context routing and registry lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Conversation,
    CodeGeneration,
    CodeExplanation,
    ImageAnalysis,
    Vision,
    ImageGeneration,
    CreativeWriting,
    LogicalAnalysis,
    Multilingual,
    SpeechRecognition,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Conversation => "conversation",
            Capability::CodeGeneration => "code_generation",
            Capability::CodeExplanation => "code_explanation",
            Capability::ImageAnalysis => "image_analysis",
            Capability::Vision => "vision",
            Capability::ImageGeneration => "image_generation",
            Capability::CreativeWriting => "creative_writing",
            Capability::LogicalAnalysis => "logical_analysis",
            Capability::Multilingual => "multilingual",
            Capability::SpeechRecognition => "speech_recognition",
        }
    }

    /// Parse a capability name, accepting `-` or `_` separators in any case
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        let capability = match normalized.as_str() {
            "conversation" => Capability::Conversation,
            "code_generation" => Capability::CodeGeneration,
            "code_explanation" => Capability::CodeExplanation,
            "image_analysis" => Capability::ImageAnalysis,
            "vision" => Capability::Vision,
            "image_generation" => Capability::ImageGeneration,
            "creative_writing" => Capability::CreativeWriting,
            "logical_analysis" => Capability::LogicalAnalysis,
            "multilingual" => Capability::Multilingual,
            "speech_recognition" => Capability::SpeechRecognition,
            _ => return None,
        };
        Some(capability)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of an agent, fixed at registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<Capability>,
    /// Memory held while resident, in megabytes
    pub resource_cost_mb: u64,
    /// Higher wins when several agents could serve a request
    pub priority: u8,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: Vec::new(),
            resource_cost_mb: 0,
            priority: 0,
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_cost(mut self, resource_cost_mb: u64) -> Self {
        self.resource_cost_mb = resource_cost_mb;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Unloaded,
    Loading,
    Ready,
    Busy,
    Error,
}

/// Shape of an agent: a single backend or two agents combined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentKind {
    Leaf,
    Composite {
        primary: String,
        secondary: String,
        strategy: CombineStrategy,
    },
}

/// Binary payload attached to a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    pub content: String,
    /// Prior conversation turns, oldest first
    #[serde(default)]
    pub history: Vec<String>,
    pub ambient_context: Option<String>,
    #[serde(default)]
    pub images: Vec<Attachment>,
    pub audio: Option<Attachment>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl AgentInput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Final answer for the caller
    Text,
    /// Text recognized from audio that still needs answering
    Transcription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: String,
    pub content: String,
    pub confidence: f32,
    pub processing_time_ms: u64,
    pub kind: OutputKind,
    pub timings: Option<PhaseTimings>,
}

impl AgentOutput {
    pub fn text(agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            content: content.into(),
            confidence: 1.0,
            processing_time_ms: 0,
            kind: OutputKind::Text,
            timings: None,
        }
    }

    pub fn transcription(agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: OutputKind::Transcription,
            ..Self::text(agent_id, content)
        }
    }

    pub fn is_transcription(&self) -> bool {
        self.kind == OutputKind::Transcription
    }
}

/// Failures raised by agents themselves
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Load failed: {message}")]
    LoadFailed { message: String },

    #[error("Processing failed: {message}")]
    ProcessingFailed { message: String },

    #[error("Unload failed: {message}")]
    UnloadFailed { message: String },

    #[error("Agent {agent_id} is not ready (state: {state:?})")]
    NotReady { agent_id: String, state: AgentState },
}

impl AgentError {
    pub fn load_failed<S: Into<String>>(message: S) -> Self {
        Self::LoadFailed {
            message: message.into(),
        }
    }

    pub fn processing_failed<S: Into<String>>(message: S) -> Self {
        Self::ProcessingFailed {
            message: message.into(),
        }
    }

    pub fn unload_failed<S: Into<String>>(message: S) -> Self {
        Self::UnloadFailed {
            message: message.into(),
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Type-erased handle to whatever inference engine an agent drives
pub type BackendHandle = Box<dyn Any + Send + Sync>;

/// Produces a fresh, unloaded agent instance
pub type AgentFactory = Arc<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

#[async_trait]
pub trait Agent: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    fn state(&self) -> AgentState;

    fn kind(&self) -> AgentKind {
        AgentKind::Leaf
    }

    fn id(&self) -> &str {
        &self.descriptor().id
    }

    async fn load(&self, progress: &ProgressSender) -> AgentResult<()>;

    async fn unload(&self) -> AgentResult<()>;

    async fn process(&self, input: AgentInput) -> AgentResult<AgentOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_parse_accepts_variants() {
        assert_eq!(
            Capability::parse("Code-Generation"),
            Some(Capability::CodeGeneration)
        );
        assert_eq!(Capability::parse(" vision "), Some(Capability::Vision));
        assert_eq!(Capability::parse("telepathy"), None);
    }

    #[test]
    fn test_capability_round_trips_through_as_str() {
        for capability in [
            Capability::Conversation,
            Capability::SpeechRecognition,
            Capability::LogicalAnalysis,
        ] {
            assert_eq!(Capability::parse(capability.as_str()), Some(capability));
        }
    }

    #[test]
    fn test_descriptor_builder() {
        let descriptor = AgentDescriptor::new("code-agent", "Code")
            .with_capabilities([Capability::CodeGeneration])
            .with_cost(2048)
            .with_priority(8);

        assert!(descriptor.has_capability(Capability::CodeGeneration));
        assert!(!descriptor.has_capability(Capability::Vision));
        assert_eq!(descriptor.resource_cost_mb, 2048);
    }

    #[test]
    fn test_output_kinds() {
        assert!(!AgentOutput::text("a", "hi").is_transcription());
        assert!(AgentOutput::transcription("s", "hello").is_transcription());
    }
}
