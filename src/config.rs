//! Engine configuration loaded from TOML
//!
//! Every section is optional; missing sections and fields fall back to the
//! defaults below, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration for the orchestration engine
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub breakers: BreakersSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub predictive: PredictiveSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub routing: RoutingSection,
}

/// What the engine does once local retries are exhausted
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Load the designated fallback agent and run the request on it
    #[default]
    FallbackAgent,
    /// Route the request again from scratch, excluding the failed agent
    Reroute,
}

/// Request lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    /// Agent used when retries are exhausted (must be registered)
    pub fallback_agent: String,
    /// Attempts per phase before falling back
    pub max_attempts: u32,
    /// How many times a transcription may be resubmitted as a new query
    pub max_reroute_depth: u32,
    /// Queries longer than this are rejected during validation
    pub max_query_chars: usize,
    /// Initial delay between in-phase retries (doubles each attempt)
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub fallback_policy: FallbackPolicy,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            fallback_agent: "conversation-agent".to_string(),
            max_attempts: 3,
            max_reroute_depth: 1,
            max_query_chars: 8000,
            retry_backoff_ms: 100,
            max_backoff_ms: 2000,
            fallback_policy: FallbackPolicy::FallbackAgent,
        }
    }
}

/// Resource cache bounds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSection {
    /// Total memory budget for resident agents, in megabytes
    pub memory_budget_mb: u64,
    /// Maximum number of resident agents
    pub max_agents: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            memory_budget_mb: 8000,
            max_agents: 2,
        }
    }
}

/// Settings for one family of circuit breakers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing a trial call
    pub reset_timeout_ms: u64,
    /// Per-call timeout; expiry counts as a failure
    pub call_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl BreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "breakers.{name}.failure_threshold must be at least 1"
            )));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "breakers.{name}.call_timeout_ms must be greater than 0"
            )));
        }
        Ok(())
    }
}

/// Separate breaker families for agent loading and inference
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakersSection {
    #[serde(default = "default_load_breaker")]
    pub load: BreakerSettings,
    #[serde(default)]
    pub inference: BreakerSettings,
}

fn default_load_breaker() -> BreakerSettings {
    BreakerSettings {
        failure_threshold: 3,
        reset_timeout_ms: 30_000,
        call_timeout_ms: 120_000,
    }
}

impl Default for BreakersSection {
    fn default() -> Self {
        Self {
            load: default_load_breaker(),
            inference: BreakerSettings::default(),
        }
    }
}

/// Admission control
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSection {
    pub max_concurrency: usize,
    pub max_waiting: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            max_waiting: 10,
        }
    }
}

/// Speculative preloading
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PredictiveSection {
    pub enabled: bool,
    /// Number of recent agents remembered
    pub history_size: usize,
    /// Predictions below this confidence are discarded
    pub min_confidence: f64,
    /// Minimum time between two predictions
    pub cooldown_ms: u64,
}

impl Default for PredictiveSection {
    fn default() -> Self {
        Self {
            enabled: true,
            history_size: 10,
            min_confidence: 0.3,
            cooldown_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySection {
    pub enabled: bool,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Heuristic router targets and scoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingSection {
    /// Agent chosen when no rule matches
    pub default_agent: String,
    /// Agent chosen when the request carries images
    pub vision_agent: String,
    /// Agent chosen when the request carries audio
    pub speech_agent: String,
    /// Confidence reported for the default route
    pub default_confidence: f64,
    /// Rule scores are divided by this before capping
    pub confidence_normalizer: f64,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            default_agent: "conversation-agent".to_string(),
            vision_agent: "vision-agent".to_string(),
            speech_agent: "speech-to-text-agent".to_string(),
            default_confidence: 0.6,
            confidence_normalizer: 2.0,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid agent ID format: {0}")]
    InvalidAgentId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_agent_id(&self.engine.fallback_agent)?;
        validate_agent_id(&self.routing.default_agent)?;
        validate_agent_id(&self.routing.vision_agent)?;
        validate_agent_id(&self.routing.speech_agent)?;

        if self.engine.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "engine.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.engine.max_query_chars == 0 {
            return Err(ConfigError::InvalidConfig(
                "engine.max_query_chars must be greater than 0".to_string(),
            ));
        }
        if self.cache.memory_budget_mb == 0 || self.cache.max_agents == 0 {
            return Err(ConfigError::InvalidConfig(
                "cache.memory_budget_mb and cache.max_agents must be greater than 0".to_string(),
            ));
        }
        if self.queue.max_concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue.max_concurrency must be at least 1".to_string(),
            ));
        }
        self.breakers.load.validate("load")?;
        self.breakers.inference.validate("inference")?;

        if !(0.0..=1.0).contains(&self.predictive.min_confidence) {
            return Err(ConfigError::InvalidConfig(
                "predictive.min_confidence must be within [0, 1]".to_string(),
            ));
        }
        if self.predictive.history_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "predictive.history_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.routing.default_confidence) {
            return Err(ConfigError::InvalidConfig(
                "routing.default_confidence must be within [0, 1]".to_string(),
            ));
        }
        if self.routing.confidence_normalizer <= 0.0 {
            return Err(ConfigError::InvalidConfig(
                "routing.confidence_normalizer must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a test configuration for unit testing: no retry backoff, short timeouts
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[engine]
retry_backoff_ms = 0
max_backoff_ms = 0

[breakers.load]
failure_threshold = 10
reset_timeout_ms = 1000
call_timeout_ms = 1000

[breakers.inference]
failure_threshold = 10
reset_timeout_ms = 1000
call_timeout_ms = 1000

[predictive]
enabled = false
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Agent ids must match [a-zA-Z0-9._-]+
pub fn validate_agent_id(agent_id: &str) -> Result<(), ConfigError> {
    let valid_chars = agent_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if agent_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidAgentId(format!(
            "Agent ID '{agent_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
