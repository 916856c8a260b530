//! Routing decisions as seen by callers
//!
//! Tests cover the keyword rules on realistic queries, context overrides for
//! attachments, and classifier degradation back to the heuristic router.

use inference_orchestrator::agent::{AgentDescriptor, Capability};
use inference_orchestrator::config::RoutingSection;
use inference_orchestrator::routing::{ClassifierRouter, HeuristicRouter, Router, RoutingContext};
use inference_orchestrator::testing::MockClassifier;
use proptest::prelude::*;
use std::sync::Arc;

fn roster() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new("conversation-agent", "Conversation")
            .with_capabilities([Capability::Conversation, Capability::CreativeWriting]),
        AgentDescriptor::new("code-agent", "Code")
            .with_capabilities([Capability::CodeGeneration, Capability::CodeExplanation]),
        AgentDescriptor::new("vision-agent", "Vision")
            .with_capabilities([Capability::Vision, Capability::ImageAnalysis]),
        AgentDescriptor::new("speech-to-text-agent", "Speech")
            .with_capabilities([Capability::SpeechRecognition]),
        AgentDescriptor::new("logical-agent", "Logic")
            .with_capabilities([Capability::LogicalAnalysis]),
        AgentDescriptor::new("multilingual-agent", "Languages")
            .with_capabilities([Capability::Multilingual]),
    ]
}

fn heuristic() -> HeuristicRouter {
    let router = HeuristicRouter::new(RoutingSection::default());
    for descriptor in roster() {
        router.register_agent(descriptor);
    }
    router
}

#[tokio::test]
async fn test_empty_query_uses_default_agent() {
    let decision = heuristic().route("").await.unwrap();
    assert_eq!(decision.selected_agent_id, "conversation-agent");
    assert!(decision.reasoning.contains("default"));
}

#[tokio::test]
async fn test_french_code_request_routes_to_code_agent() {
    let decision = heuristic()
        .route("Écris une fonction en Python")
        .await
        .unwrap();
    assert_eq!(decision.selected_agent_id, "code-agent");
    assert!(decision.confidence > 0.7);
}

#[tokio::test]
async fn test_routing_ignores_case() {
    let router = heuristic();
    let upper = router.route("CODE").await.unwrap();
    let lower = router.route("code").await.unwrap();
    assert_eq!(upper.selected_agent_id, lower.selected_agent_id);
    assert_eq!(upper.confidence, lower.confidence);
}

#[tokio::test]
async fn test_images_win_over_audio() {
    let context = RoutingContext {
        has_images: true,
        has_audio: true,
        ..RoutingContext::default()
    };
    let decision = heuristic()
        .route_with_context("translate this", &context)
        .await
        .unwrap();
    assert_eq!(decision.selected_agent_id, "vision-agent");
}

#[tokio::test]
async fn test_audio_routes_to_transcription() {
    let context = RoutingContext {
        has_audio: true,
        ..RoutingContext::default()
    };
    let decision = heuristic().route_with_context("", &context).await.unwrap();
    assert_eq!(decision.selected_agent_id, "speech-to-text-agent");
}

#[tokio::test]
async fn test_translation_request() {
    let decision = heuristic()
        .route("Translate this sentence in english please")
        .await
        .unwrap();
    assert_eq!(decision.selected_agent_id, "multilingual-agent");
}

#[tokio::test]
async fn test_excluded_agent_is_never_selected() {
    let context = RoutingContext {
        excluded_agents: vec!["code-agent".to_string()],
        ..RoutingContext::default()
    };
    let decision = heuristic()
        .route_with_context("write a python function", &context)
        .await
        .unwrap();
    assert_eq!(decision.selected_agent_id, "conversation-agent");
}

#[tokio::test]
async fn test_preferred_capability_selects_provider() {
    let context = RoutingContext {
        preferred_capability: Some(Capability::LogicalAnalysis),
        ..RoutingContext::default()
    };
    let decision = heuristic()
        .route_with_context("hello there", &context)
        .await
        .unwrap();
    assert_eq!(decision.selected_agent_id, "logical-agent");
}

#[tokio::test]
async fn test_confident_classifier_overrides_keywords() {
    let classifier = Arc::new(MockClassifier::returning(Capability::LogicalAnalysis, 0.8));
    let router = ClassifierRouter::new(classifier.clone(), HeuristicRouter::new(RoutingSection::default()));
    for descriptor in roster() {
        router.register_agent(descriptor);
    }

    let decision = router.route("write some code").await.unwrap();
    assert_eq!(decision.selected_agent_id, "logical-agent");
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test]
async fn test_classifier_degrades_to_heuristic() {
    for classifier in [
        MockClassifier::failing(),
        MockClassifier::unavailable(),
        MockClassifier::returning(Capability::LogicalAnalysis, 0.2),
    ] {
        let router = ClassifierRouter::new(
            Arc::new(classifier),
            HeuristicRouter::new(RoutingSection::default()),
        );
        for descriptor in roster() {
            router.register_agent(descriptor);
        }

        let decision = router.route("write some python code").await.unwrap();
        assert_eq!(decision.selected_agent_id, "code-agent");
    }
}

proptest! {
    #[test]
    fn prop_confidence_within_unit_interval(query in "\\PC{0,200}", images: bool, audio: bool) {
        let router = heuristic();
        let context = RoutingContext {
            has_images: images,
            has_audio: audio,
            ..RoutingContext::default()
        };
        let decision = router.decide(&query, &context).unwrap();
        prop_assert!((0.0..=1.0).contains(&decision.confidence));
        prop_assert!(!decision.selected_agent_id.is_empty());
    }

    #[test]
    fn prop_routing_is_deterministic(query in "[a-zA-Zéè ]{0,80}") {
        let router = heuristic();
        let first = router.decide(&query, &RoutingContext::default()).unwrap();
        let second = router.decide(&query, &RoutingContext::default()).unwrap();
        prop_assert_eq!(first, second);
    }
}
