//! Predictive preloading
//!
//! After each completed response the engine hands the loader a hint: the agent
//! that just answered and the query text. The loader guesses which agent the
//! next request will need and fires the registered preload callback in a
//! background task. Nothing here is ever awaited on the request path, and
//! preload failures are only logged.
//!
//! Prediction sources:
//! - a static transition table from the current agent to likely successors
//!   (staying on the same agent is only predicted when its weight is at least 0.5)
//! - keyword hints in the query text, boosted by the number of matches
//!
//! When both sources name the same agent their confidences are combined.
//! Without any keyword match the table's top candidate wins.

use crate::config::PredictiveSection;
use crate::error::OrchestratorResult;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SELF_TRANSITION_FLOOR: f64 = 0.5;
const MAX_KEYWORD_CONFIDENCE: f64 = 0.9;
const MAX_MERGED_CONFIDENCE: f64 = 0.95;

static TRANSITIONS: &[(&str, &[(&str, f64)])] = &[
    (
        "conversation-agent",
        &[
            ("code-agent", 0.3),
            ("creative-agent", 0.2),
            ("logical-agent", 0.2),
            ("conversation-agent", 0.2),
            ("multilingual-agent", 0.1),
        ],
    ),
    (
        "code-agent",
        &[
            ("conversation-agent", 0.4),
            ("logical-agent", 0.3),
            ("code-agent", 0.3),
        ],
    ),
    (
        "vision-agent",
        &[
            ("conversation-agent", 0.5),
            ("creative-agent", 0.3),
            ("code-agent", 0.2),
        ],
    ),
    (
        "creative-agent",
        &[
            ("conversation-agent", 0.4),
            ("creative-agent", 0.3),
            ("multilingual-agent", 0.2),
            ("vision-agent", 0.1),
        ],
    ),
    (
        "logical-agent",
        &[
            ("conversation-agent", 0.4),
            ("code-agent", 0.3),
            ("logical-agent", 0.3),
        ],
    ),
    (
        "multilingual-agent",
        &[
            ("conversation-agent", 0.5),
            ("multilingual-agent", 0.3),
            ("creative-agent", 0.2),
        ],
    ),
    (
        "speech-to-text-agent",
        &[("conversation-agent", 0.8), ("multilingual-agent", 0.2)],
    ),
];

static KEYWORD_HINTS: &[(&str, f64, &[&str])] = &[
    (
        "code-agent",
        0.4,
        &["code", "function", "debug", "error", "bug", "program", "script", "variable"],
    ),
    (
        "creative-agent",
        0.3,
        &["write", "story", "poem", "creative", "imagine", "brainstorm", "idea"],
    ),
    (
        "logical-agent",
        0.3,
        &["calculate", "math", "logic", "problem", "solve", "analyze", "reason"],
    ),
    (
        "multilingual-agent",
        0.4,
        &["translate", "language", "français", "español", "deutsch", "chinese"],
    ),
    (
        "vision-agent",
        0.4,
        &["image", "photo", "picture", "visual", "see", "look", "show"],
    ),
];

/// What the loader knows after a response completes
#[derive(Debug, Clone, Default)]
pub struct PredictionSignal {
    /// Agent that just answered; defaults to the most recent in history
    pub current_agent: Option<String>,
    /// Text to scan for keyword hints, usually the last query
    pub hint_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub agent_id: String,
    pub confidence: f64,
    pub reason: String,
}

/// Invoked with the predicted agent id; runs detached from the request path
pub type PreloadCallback = Arc<dyn Fn(String) -> BoxFuture<'static, OrchestratorResult<()>> + Send + Sync>;

#[derive(Default)]
struct LoaderState {
    history: VecDeque<String>,
    last_prediction_at: Option<Instant>,
    last_prediction: Option<Prediction>,
    available: Option<HashSet<String>>,
}

pub struct PredictiveLoader {
    settings: PredictiveSection,
    enabled: AtomicBool,
    state: Mutex<LoaderState>,
    callback: RwLock<Option<PreloadCallback>>,
    hints: Mutex<Vec<AbortHandle>>,
}

impl PredictiveLoader {
    pub fn new(settings: PredictiveSection) -> Self {
        Self {
            enabled: AtomicBool::new(settings.enabled),
            settings,
            state: Mutex::new(LoaderState::default()),
            callback: RwLock::new(None),
            hints: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "Predictive loading toggled");
    }

    pub fn on_preload(&self, callback: PreloadCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Restrict predictions to these agent ids
    pub fn set_available_agents<I, S>(&self, agents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().available = Some(agents.into_iter().map(Into::into).collect());
    }

    /// Remember that `agent_id` served a request
    pub fn record_usage(&self, agent_id: &str) {
        let mut state = self.state.lock();
        state.history.push_back(agent_id.to_string());
        while state.history.len() > self.settings.history_size {
            state.history.pop_front();
        }
    }

    /// Recent agents, oldest first
    pub fn recent_agents(&self) -> Vec<String> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn last_prediction(&self) -> Option<Prediction> {
        self.state.lock().last_prediction.clone()
    }

    /// Clear history, cooldown and the last prediction
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.last_prediction_at = None;
        state.last_prediction = None;
    }

    /// Best guess for the next agent, or `None` when disabled, cooling down,
    /// or nothing clears the confidence floor
    pub fn predict_next(&self, signal: &PredictionSignal) -> Option<Prediction> {
        if !self.is_enabled() {
            return None;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let cooldown = Duration::from_millis(self.settings.cooldown_ms);
        if let Some(last) = state.last_prediction_at {
            if now.duration_since(last) < cooldown {
                debug!("Prediction skipped during cooldown");
                return None;
            }
        }
        state.last_prediction_at = Some(now);

        let current = signal
            .current_agent
            .clone()
            .or_else(|| state.history.back().cloned());

        let mut candidates: Vec<Prediction> = Vec::new();
        if let Some(current) = &current {
            candidates.extend(from_transitions(current));
        }
        if let Some(text) = &signal.hint_text {
            for hint in from_keywords(text) {
                merge(&mut candidates, hint);
            }
        }

        let best = candidates
            .into_iter()
            .filter(|p| {
                state
                    .available
                    .as_ref()
                    .map_or(true, |set| set.contains(&p.agent_id))
            })
            .filter(|p| p.confidence >= self.settings.min_confidence)
            .fold(None::<Prediction>, |best, p| match best {
                Some(b) if b.confidence >= p.confidence => Some(b),
                _ => Some(p),
            });

        if let Some(prediction) = &best {
            debug!(
                agent_id = %prediction.agent_id,
                confidence = prediction.confidence,
                reason = %prediction.reason,
                "Predicted next agent"
            );
        }
        state.last_prediction = best.clone();
        best
    }

    /// Predict and preload in a background task. Returns `None` when nothing
    /// was spawned.
    pub fn spawn_hint(self: &Arc<Self>, signal: PredictionSignal) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }

        let loader = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let Some(prediction) = loader.predict_next(&signal) else {
                return;
            };
            let Some(callback) = loader.callback.read().clone() else {
                debug!("No preload callback registered");
                return;
            };

            info!(
                agent_id = %prediction.agent_id,
                confidence = prediction.confidence,
                "Preloading predicted agent"
            );
            if let Err(e) = callback(prediction.agent_id.clone()).await {
                warn!(agent_id = %prediction.agent_id, error = %e, "Preload failed");
            }
        });

        let mut hints = self.hints.lock();
        hints.retain(|hint| !hint.is_finished());
        hints.push(handle.abort_handle());
        Some(handle)
    }

    /// Abort hint tasks that are still waiting or preloading. Returns how many
    /// were running.
    pub fn abort_pending(&self) -> usize {
        let hints: Vec<AbortHandle> = self.hints.lock().drain(..).collect();
        let mut aborted = 0;
        for hint in hints {
            if !hint.is_finished() {
                hint.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            debug!(aborted, "Aborted pending preload hints");
        }
        aborted
    }
}

fn from_transitions(current: &str) -> Vec<Prediction> {
    let Some((_, targets)) = TRANSITIONS.iter().find(|(from, _)| *from == current) else {
        return Vec::new();
    };

    targets
        .iter()
        .filter(|(to, weight)| *to != current || *weight >= SELF_TRANSITION_FLOOR)
        .map(|(to, weight)| Prediction {
            agent_id: to.to_string(),
            confidence: *weight,
            reason: format!("transition from {current}"),
        })
        .collect()
}

fn from_keywords(text: &str) -> Vec<Prediction> {
    let lower = text.to_lowercase();
    KEYWORD_HINTS
        .iter()
        .filter_map(|(agent_id, base, keywords)| {
            let matched: Vec<&str> = keywords
                .iter()
                .copied()
                .filter(|k| lower.contains(k))
                .collect();
            if matched.is_empty() {
                return None;
            }
            let boosted = (base * (1.0 + matched.len() as f64 * 0.1)).min(MAX_KEYWORD_CONFIDENCE);
            Some(Prediction {
                agent_id: agent_id.to_string(),
                confidence: boosted,
                reason: format!("keywords: {}", matched.join(", ")),
            })
        })
        .collect()
}

fn merge(candidates: &mut Vec<Prediction>, incoming: Prediction) {
    match candidates.iter_mut().find(|p| p.agent_id == incoming.agent_id) {
        Some(existing) => {
            existing.confidence =
                ((existing.confidence + incoming.confidence) / 1.5).min(MAX_MERGED_CONFIDENCE);
            existing.reason = format!("{} + {}", existing.reason, incoming.reason);
        }
        None => candidates.push(incoming),
    }
}

/// Transition weights out of `agent_id`, for diagnostics
pub fn transition_table() -> HashMap<&'static str, Vec<(&'static str, f64)>> {
    TRANSITIONS
        .iter()
        .map(|(from, targets)| (*from, targets.to_vec()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn loader() -> PredictiveLoader {
        PredictiveLoader::new(PredictiveSection {
            enabled: true,
            history_size: 3,
            min_confidence: 0.3,
            cooldown_ms: 0,
        })
    }

    fn signal(current: &str, text: &str) -> PredictionSignal {
        PredictionSignal {
            current_agent: Some(current.to_string()),
            hint_text: Some(text.to_string()),
        }
    }

    #[test]
    fn test_table_top_candidate_without_keywords() {
        let prediction = loader().predict_next(&signal("speech-to-text-agent", "hello")).unwrap();
        assert_eq!(prediction.agent_id, "conversation-agent");
        assert_eq!(prediction.confidence, 0.8);
    }

    #[test]
    fn test_keywords_refine_transition() {
        // code-agent: 0.3 from the table merged with 0.4 * 1.2 from two keywords
        let prediction = loader()
            .predict_next(&signal("conversation-agent", "please debug this function"))
            .unwrap();
        assert_eq!(prediction.agent_id, "code-agent");
        assert!((prediction.confidence - (0.3 + 0.48) / 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_low_self_transition_is_skipped() {
        let predictions = from_transitions("code-agent");
        assert!(predictions.iter().all(|p| p.agent_id != "code-agent"));
    }

    #[test]
    fn test_unknown_agent_without_hints_predicts_nothing() {
        assert!(loader().predict_next(&signal("mystery-agent", "")).is_none());
    }

    #[test]
    fn test_min_confidence_filters() {
        let loader = PredictiveLoader::new(PredictiveSection {
            min_confidence: 0.85,
            cooldown_ms: 0,
            ..PredictiveSection::default()
        });
        assert!(loader.predict_next(&signal("code-agent", "")).is_none());
    }

    #[test]
    fn test_available_agents_filter_candidates() {
        let loader = loader();
        loader.set_available_agents(["logical-agent"]);
        let prediction = loader.predict_next(&signal("code-agent", "")).unwrap();
        assert_eq!(prediction.agent_id, "logical-agent");
    }

    #[test]
    fn test_history_is_bounded_and_used_as_current() {
        let loader = loader();
        for id in ["a", "b", "c", "speech-to-text-agent"] {
            loader.record_usage(id);
        }
        assert_eq!(
            loader.recent_agents(),
            vec!["b", "c", "speech-to-text-agent"]
        );

        let prediction = loader.predict_next(&PredictionSignal::default()).unwrap();
        assert_eq!(prediction.agent_id, "conversation-agent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_back_to_back_predictions() {
        let loader = PredictiveLoader::new(PredictiveSection {
            cooldown_ms: 5000,
            ..PredictiveSection::default()
        });
        assert!(loader.predict_next(&signal("code-agent", "")).is_some());
        assert!(loader.predict_next(&signal("code-agent", "")).is_none());

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert!(loader.predict_next(&signal("code-agent", "")).is_some());
    }

    #[test]
    fn test_transition_weights_sum_to_one() {
        for (from, targets) in transition_table() {
            let total: f64 = targets.iter().map(|(_, w)| w).sum();
            assert!((total - 1.0).abs() < 1e-9, "{from} sums to {total}");
        }
    }

    #[test]
    fn test_disabled_loader_predicts_nothing() {
        let loader = loader();
        loader.set_enabled(false);
        assert!(loader.predict_next(&signal("code-agent", "")).is_none());
    }

    #[tokio::test]
    async fn test_spawn_hint_invokes_callback_and_swallows_errors() {
        let loader = Arc::new(loader());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        loader.on_preload(Arc::new(move |_agent_id| {
            seen.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(crate::error::OrchestratorError::load_failure("x", "nope"))
            })
        }));

        let handle = loader
            .spawn_hint(signal("speech-to-text-agent", ""))
            .unwrap();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
