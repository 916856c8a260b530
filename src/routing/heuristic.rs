//! Keyword-rule router
//!
//! Routing order:
//! 1. images present: vision agent at confidence 1.0 (wins over audio)
//! 2. audio present: speech agent at confidence 1.0
//! 3. preferred capability: first registered agent advertising it, at 0.9
//! 4. keyword rules: score = matched / total * weight, best score wins,
//!    confidence = min(score / normalizer, 0.95); ties go to the earlier rule
//! 5. nothing matched: the default agent with a fixed moderate confidence
//!
//! Matching ignores case and punctuation. A keyword matches when every one of
//! its words starts a word of the query, in order, so "fonction" also matches
//! "fonctions".

use super::router::{Router, RoutingContext, RoutingDecision};
use crate::agent::{AgentDescriptor, Capability};
use crate::config::RoutingSection;
use crate::error::{OrchestratorError, OrchestratorResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

const MAX_RULE_CONFIDENCE: f64 = 0.95;
const CONTEXT_CONFIDENCE: f64 = 1.0;
const CAPABILITY_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRule {
    pub keywords: Vec<String>,
    pub target_agent_id: String,
    pub capability: Option<Capability>,
    pub weight: f64,
}

impl RoutingRule {
    pub fn new(target_agent_id: &str, weight: f64, keywords: &[&str]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| normalize(k)).collect(),
            target_agent_id: target_agent_id.to_string(),
            capability: None,
            weight,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    fn matches<'a>(&'a self, normalized_query: &str) -> Vec<&'a str> {
        self.keywords
            .iter()
            .filter(|kw| !kw.is_empty() && normalized_query.contains(&format!(" {kw}")))
            .map(String::as_str)
            .collect()
    }
}

/// Lowercase, turn punctuation into spaces and pad with spaces so that
/// `" {keyword}"` finds keywords at word starts only
fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '+' || c == '#' {
                c
            } else {
                ' '
            }
        })
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    format!(" {} ", words.join(" "))
}

/// Built-in rule list, highest precedence first
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::new(
            "creative-agent",
            11.0,
            &[
                "génère image",
                "crée image",
                "dessine",
                "illustre",
                "draw",
                "generate image",
                "create image",
                "picture of",
            ],
        )
        .with_capability(Capability::ImageGeneration),
        RoutingRule::new(
            "vision-agent",
            10.0,
            &[
                "image",
                "photo",
                "picture",
                "regarde",
                "what do you see",
                "describe this",
                "screenshot",
                "capture d'écran",
            ],
        )
        .with_capability(Capability::ImageAnalysis),
        RoutingRule::new(
            "code-agent",
            9.0,
            &[
                "code",
                "fonction",
                "function",
                "script",
                "programme",
                "class",
                "javascript",
                "python",
                "typescript",
                "rust",
            ],
        )
        .with_capability(Capability::CodeGeneration),
        RoutingRule::new(
            "code-agent",
            9.0,
            &[
                "explique code",
                "comment fonctionne",
                "debug",
                "erreur dans",
                "bug",
                "stack trace",
            ],
        )
        .with_capability(Capability::CodeExplanation),
        RoutingRule::new(
            "logical-agent",
            8.0,
            &[
                "analyse",
                "analyze",
                "décompose",
                "étape",
                "step by step",
                "logique",
                "raisonnement",
                "pourquoi",
                "why",
            ],
        )
        .with_capability(Capability::LogicalAnalysis),
        RoutingRule::new(
            "multilingual-agent",
            8.0,
            &[
                "traduis",
                "traduire",
                "translate",
                "translation",
                "en anglais",
                "in english",
                "en espagnol",
                "in spanish",
            ],
        )
        .with_capability(Capability::Multilingual),
        RoutingRule::new(
            "conversation-agent",
            7.0,
            &[
                "créatif",
                "imagination",
                "invente",
                "histoire",
                "story",
                "poème",
                "poem",
            ],
        )
        .with_capability(Capability::CreativeWriting),
    ]
}

/// Stateless keyword router with context overrides
pub struct HeuristicRouter {
    settings: RoutingSection,
    rules: Vec<RoutingRule>,
    agents: RwLock<Vec<AgentDescriptor>>,
}

impl HeuristicRouter {
    pub fn new(settings: RoutingSection) -> Self {
        Self {
            settings,
            rules: default_rules(),
            agents: RwLock::new(Vec::new()),
        }
    }

    pub fn with_rules(mut self, rules: Vec<RoutingRule>) -> Self {
        self.rules = rules;
        self
    }

    fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.read().iter().any(|d| d.id == agent_id)
    }

    /// Synchronous routing used directly and by classifier-backed routers
    pub fn decide(&self, query: &str, context: &RoutingContext) -> OrchestratorResult<RoutingDecision> {
        if let Some(decision) = self.context_override(context) {
            return Ok(decision);
        }

        let normalized = normalize(query);
        let mut best: Option<(f64, &RoutingRule, Vec<&str>)> = None;

        for rule in &self.rules {
            if rule.keywords.is_empty()
                || !self.is_registered(&rule.target_agent_id)
                || context.is_excluded(&rule.target_agent_id)
            {
                continue;
            }

            let matched = rule.matches(&normalized);
            if matched.is_empty() {
                continue;
            }

            let score = matched.len() as f64 / rule.keywords.len() as f64 * rule.weight;
            if best.as_ref().map_or(true, |(top, _, _)| score > *top) {
                best = Some((score, rule, matched));
            }
        }

        if let Some((score, rule, matched)) = best {
            let confidence = (score / self.settings.confidence_normalizer).min(MAX_RULE_CONFIDENCE);
            let mut reasoning = format!("matched keywords: {}", matched.join(", "));
            if let Some(capability) = rule.capability {
                reasoning.push_str(&format!(" ({capability})"));
            }
            debug!(
                agent_id = %rule.target_agent_id,
                score,
                confidence,
                "Keyword rule selected agent"
            );
            return Ok(RoutingDecision::new(
                &rule.target_agent_id,
                confidence,
                reasoning,
            ));
        }

        let default_agent = &self.settings.default_agent;
        if context.is_excluded(default_agent) {
            return Err(OrchestratorError::routing_failure(format!(
                "no eligible agent: default agent '{default_agent}' is excluded"
            )));
        }

        Ok(RoutingDecision::new(
            default_agent,
            self.settings.default_confidence,
            "default route: no keyword matched",
        ))
    }

    fn context_override(&self, context: &RoutingContext) -> Option<RoutingDecision> {
        if context.has_images && !context.is_excluded(&self.settings.vision_agent) {
            return Some(RoutingDecision::new(
                &self.settings.vision_agent,
                CONTEXT_CONFIDENCE,
                "images attached: using the vision agent",
            ));
        }

        if context.has_audio && !context.is_excluded(&self.settings.speech_agent) {
            return Some(RoutingDecision::new(
                &self.settings.speech_agent,
                CONTEXT_CONFIDENCE,
                "audio attached: using the transcription agent",
            ));
        }

        let capability = context.preferred_capability?;
        let agents = self.agents.read();
        agents
            .iter()
            .find(|d| d.has_capability(capability) && !context.is_excluded(&d.id))
            .map(|d| {
                RoutingDecision::new(
                    &d.id,
                    CAPABILITY_CONFIDENCE,
                    format!("preferred capability: {capability}"),
                )
            })
    }
}

#[async_trait]
impl Router for HeuristicRouter {
    fn register_agent(&self, descriptor: AgentDescriptor) {
        let mut agents = self.agents.write();
        match agents.iter_mut().find(|d| d.id == descriptor.id) {
            Some(existing) => *existing = descriptor,
            None => agents.push(descriptor),
        }
    }

    async fn route_with_context(
        &self,
        query: &str,
        context: &RoutingContext,
    ) -> OrchestratorResult<RoutingDecision> {
        self.decide(query, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> HeuristicRouter {
        let router = HeuristicRouter::new(RoutingSection::default());
        for (id, caps) in [
            ("conversation-agent", vec![Capability::Conversation]),
            ("code-agent", vec![Capability::CodeGeneration]),
            ("vision-agent", vec![Capability::Vision]),
            ("logical-agent", vec![Capability::LogicalAnalysis]),
        ] {
            router.register_agent(AgentDescriptor::new(id, id).with_capabilities(caps));
        }
        router
    }

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("Hello, WORLD!"), " hello world ");
        assert_eq!(normalize("C++ / C#"), " c++ c# ");
        assert_eq!(normalize(""), "  ");
    }

    #[test]
    fn test_keyword_matches_word_prefix_only() {
        let rule = RoutingRule::new("code-agent", 1.0, &["code"]);
        assert_eq!(rule.matches(&normalize("Codes sources")), vec!["code"]);
        assert!(rule.matches(&normalize("barcode")).is_empty());
    }

    #[test]
    fn test_empty_query_routes_to_default() {
        let decision = router().decide("", &RoutingContext::default()).unwrap();
        assert_eq!(decision.selected_agent_id, "conversation-agent");
        assert!(decision.reasoning.contains("default"));
        assert_eq!(decision.confidence, 0.6);
    }

    #[test]
    fn test_unregistered_rule_targets_are_skipped() {
        // multilingual-agent is not registered in this router
        let decision = router()
            .decide("translate this please", &RoutingContext::default())
            .unwrap();
        assert_eq!(decision.selected_agent_id, "conversation-agent");
    }

    #[test]
    fn test_higher_weight_wins() {
        let decision = router()
            .decide("analyse this photo", &RoutingContext::default())
            .unwrap();
        assert_eq!(decision.selected_agent_id, "vision-agent");
    }

    #[test]
    fn test_ties_favor_earlier_rule() {
        let router = HeuristicRouter::new(RoutingSection::default()).with_rules(vec![
            RoutingRule::new("first", 5.0, &["alpha"]),
            RoutingRule::new("second", 5.0, &["alpha"]),
        ]);
        router.register_agent(AgentDescriptor::new("first", "first"));
        router.register_agent(AgentDescriptor::new("second", "second"));

        let decision = router.decide("alpha", &RoutingContext::default()).unwrap();
        assert_eq!(decision.selected_agent_id, "first");
    }

    #[test]
    fn test_excluded_default_is_a_routing_failure() {
        let context = RoutingContext {
            excluded_agents: vec!["conversation-agent".to_string()],
            ..Default::default()
        };
        let result = router().decide("bonjour", &context);
        assert!(matches!(
            result,
            Err(OrchestratorError::RoutingFailure { .. })
        ));
    }

    #[test]
    fn test_capability_preference_without_provider_falls_through() {
        let context = RoutingContext {
            preferred_capability: Some(Capability::SpeechRecognition),
            ..Default::default()
        };
        let decision = router().decide("write python", &context).unwrap();
        assert_eq!(decision.selected_agent_id, "code-agent");
    }
}
