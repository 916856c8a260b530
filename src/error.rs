//! Error taxonomy for the orchestration layer
//!
//! Every failure that leaves the engine is an [`OrchestratorError`]. Failures raised
//! inside a request phase are wrapped in [`OrchestratorError::Request`] with the phase
//! and agent they occurred in, so callers get one readable message from
//! [`OrchestratorError::user_message`] while [`OrchestratorError::diagnostic_chain`]
//! keeps the structured cause chain for logs.

use crate::config::ConfigError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Request phase an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Admission,
    Validating,
    Routing,
    AgentLoading,
    Inferencing,
    Fallback,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Admission => "admission",
            Phase::Validating => "validating",
            Phase::Routing => "routing",
            Phase::AgentLoading => "agent_loading",
            Phase::Inferencing => "inferencing",
            Phase::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for orchestration operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Request refused: {reason}")]
    Refused { reason: String },

    #[error("Routing failed: {message}")]
    RoutingFailure { message: String },

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("Failed to load agent {agent_id}: {cause}")]
    LoadFailure { agent_id: String, cause: String },

    #[error("Inference failed on agent {agent_id}: {cause}")]
    InferenceFailure { agent_id: String, cause: String },

    #[error("Circuit open for {key}")]
    CircuitOpen { key: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request queue is full ({max_waiting} already waiting)")]
    QueueFull { max_waiting: usize },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{phase} failed: {source}")]
    Request {
        phase: Phase,
        agent_id: Option<String>,
        #[source]
        source: Box<OrchestratorError>,
    },
}

impl OrchestratorError {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn refused<S: Into<String>>(reason: S) -> Self {
        Self::Refused {
            reason: reason.into(),
        }
    }

    pub fn routing_failure<S: Into<String>>(message: S) -> Self {
        Self::RoutingFailure {
            message: message.into(),
        }
    }

    pub fn agent_not_found<S: Into<String>>(agent_id: S) -> Self {
        Self::AgentNotFound {
            agent_id: agent_id.into(),
        }
    }

    pub fn load_failure<A: Into<String>, C: fmt::Display>(agent_id: A, cause: C) -> Self {
        Self::LoadFailure {
            agent_id: agent_id.into(),
            cause: cause.to_string(),
        }
    }

    pub fn inference_failure<A: Into<String>, C: fmt::Display>(agent_id: A, cause: C) -> Self {
        Self::InferenceFailure {
            agent_id: agent_id.into(),
            cause: cause.to_string(),
        }
    }

    /// Wrap this error with the phase and agent it was raised in.
    ///
    /// Already-enriched errors are wrapped again so the chain records the
    /// fallback path on top of the original failure.
    pub fn in_phase(self, phase: Phase, agent_id: Option<&str>) -> Self {
        Self::Request {
            phase,
            agent_id: agent_id.map(str::to_string),
            source: Box::new(self),
        }
    }

    /// The innermost error with all enrichment peeled off
    pub fn root(&self) -> &OrchestratorError {
        match self {
            Self::Request { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stable snake_case name of the root error, for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Self::InvalidInput { .. } => "invalid_input",
            Self::Refused { .. } => "refused",
            Self::RoutingFailure { .. } => "routing_failure",
            Self::AgentNotFound { .. } => "agent_not_found",
            Self::LoadFailure { .. } => "load_failure",
            Self::InferenceFailure { .. } => "inference_failure",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "timeout",
            Self::QueueFull { .. } => "queue_full",
            Self::Cancelled => "cancelled",
            Self::NotInitialized => "not_initialized",
            Self::Config(_) => "config",
            Self::Request { .. } => "request",
        }
    }

    /// Phase of the outermost enrichment, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Request { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Agent recorded by the outermost enrichment that named one
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Request {
                agent_id: Some(id), ..
            } => Some(id),
            Self::Request { source, .. } => source.agent_id(),
            Self::LoadFailure { agent_id, .. }
            | Self::InferenceFailure { agent_id, .. }
            | Self::AgentNotFound { agent_id } => Some(agent_id),
            _ => None,
        }
    }

    /// Transient failures that the engine retries locally before falling back.
    /// An open circuit counts as the failure it guards.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Self::LoadFailure { .. }
                | Self::InferenceFailure { .. }
                | Self::CircuitOpen { .. }
                | Self::Timeout { .. }
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), Self::CircuitOpen { .. })
    }

    pub fn is_not_initialized(&self) -> bool {
        matches!(self.root(), Self::NotInitialized)
    }

    /// One readable sentence suitable for showing to an end user
    pub fn user_message(&self) -> String {
        let message = match self.root() {
            Self::InvalidInput { message } => {
                format!("Your request could not be processed: {message}")
            }
            Self::Refused { reason } => format!("This request was declined: {reason}"),
            Self::RoutingFailure { .. } => {
                "The request could not be matched to an assistant.".to_string()
            }
            Self::AgentNotFound { agent_id } => {
                format!("No assistant named '{agent_id}' is available.")
            }
            Self::LoadFailure { .. }
            | Self::InferenceFailure { .. }
            | Self::CircuitOpen { .. }
            | Self::Timeout { .. }
            | Self::Request { .. } => {
                "The assistant is temporarily unavailable. Please try again shortly.".to_string()
            }
            Self::QueueFull { .. } => {
                "Too many requests are waiting. Please try again in a moment.".to_string()
            }
            Self::Cancelled => "The request was cancelled.".to_string(),
            Self::NotInitialized => "The assistant is not ready yet.".to_string(),
            Self::Config(_) => "The assistant is misconfigured.".to_string(),
        };
        sanitize_error_message(&message)
    }

    /// Every message in the cause chain, outermost first
    pub fn diagnostic_chain(&self) -> Vec<String> {
        let mut chain = vec![sanitize_error_message(&self.to_string())];
        let mut current: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = current {
            chain.push(sanitize_error_message(&err.to_string()));
            current = err.source();
        }
        chain
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials and sensitive paths, then cap the length
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(suffix);
    }

    sanitized
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_renders_snake_case() {
        assert_eq!(Phase::AgentLoading.to_string(), "agent_loading");
        assert_eq!(
            serde_json::to_string(&Phase::Inferencing).unwrap(),
            "\"inferencing\""
        );
    }

    #[test]
    fn test_kind_peels_enrichment() {
        let err = OrchestratorError::load_failure("vision-agent", "oom")
            .in_phase(Phase::AgentLoading, Some("vision-agent"))
            .in_phase(Phase::Fallback, None);
        assert_eq!(err.kind(), "load_failure");
        assert_eq!(OrchestratorError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_root_peels_enrichment() {
        let err = OrchestratorError::load_failure("code-agent", "out of memory")
            .in_phase(Phase::AgentLoading, Some("code-agent"))
            .in_phase(Phase::Fallback, Some("conversation-agent"));

        assert!(matches!(err.root(), OrchestratorError::LoadFailure { .. }));
        assert_eq!(err.phase(), Some(Phase::Fallback));
        assert_eq!(err.agent_id(), Some("conversation-agent"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_classification() {
        assert!(OrchestratorError::CircuitOpen {
            key: "a:load".into()
        }
        .is_retryable());
        assert!(OrchestratorError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(!OrchestratorError::invalid_input("empty").is_retryable());
        assert!(!OrchestratorError::QueueFull { max_waiting: 1 }.is_retryable());
        assert!(!OrchestratorError::Cancelled.is_retryable());
        assert!(!OrchestratorError::agent_not_found("x").is_retryable());
    }

    #[test]
    fn test_not_initialized_is_distinguishable() {
        let err = OrchestratorError::NotInitialized.in_phase(Phase::Admission, None);
        assert!(err.is_not_initialized());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_user_message_hides_internal_cause() {
        let err = OrchestratorError::inference_failure("code-agent", "CUDA error at 0xdeadbeef")
            .in_phase(Phase::Inferencing, Some("code-agent"));

        let message = err.user_message();
        assert!(!message.contains("CUDA"));
        assert!(message.contains("temporarily unavailable"));
    }

    #[test]
    fn test_diagnostic_chain_keeps_causes() {
        let err = OrchestratorError::load_failure("vision-agent", "weights missing")
            .in_phase(Phase::AgentLoading, Some("vision-agent"));

        let chain = err.diagnostic_chain();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].starts_with("agent_loading failed"));
        assert!(chain[1].contains("weights missing"));
    }

    #[test]
    fn test_error_message_sanitization() {
        let sanitized =
            sanitize_error_message("Failed to authenticate: password=secret123 token=abc456");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"é".repeat(400));

        assert!(sanitized.len() <= MAX_MESSAGE_LEN);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_path_redaction() {
        let sanitized =
            sanitize_error_message("Failed to read /home/user/.ssh/id_rsa and /etc/secrets/api.key");

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }
}
