//! Pluggable input validation and output sanitization
//!
//! The engine consults a [`Guardrail`] before routing and runs every answer
//! through a [`Sanitizer`] before returning it. Real policies live outside this
//! crate; the passthrough implementations keep the engine usable without them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a guardrail decided about one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GuardrailVerdict {
    Pass,
    /// Continue with this rewritten text
    Sanitize { text: String },
    /// Refuse the request
    Block { reasons: Vec<String> },
}

#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, text: &str) -> GuardrailVerdict;
}

pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, text: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughGuardrail;

#[async_trait]
impl Guardrail for PassthroughGuardrail {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn validate(&self, _text: &str) -> GuardrailVerdict {
        GuardrailVerdict::Pass
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughSanitizer;

impl Sanitizer for PassthroughSanitizer {
    fn sanitize(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Blocks any input containing one of the given patterns, case-insensitively
#[derive(Debug, Clone)]
pub struct PatternBlockGuardrail {
    name: String,
    patterns: Vec<String>,
}

impl PatternBlockGuardrail {
    pub fn new(name: impl Into<String>, patterns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            patterns: patterns.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl Guardrail for PatternBlockGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, text: &str) -> GuardrailVerdict {
        let lower = text.to_lowercase();
        let reasons: Vec<String> = self
            .patterns
            .iter()
            .filter(|p| lower.contains(p.as_str()))
            .map(|p| format!("blocked pattern: {p}"))
            .collect();

        if reasons.is_empty() {
            GuardrailVerdict::Pass
        } else {
            GuardrailVerdict::Block { reasons }
        }
    }
}
