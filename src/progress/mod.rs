//! Load-progress notifications
//!
//! Agents report progress through a bounded channel instead of callbacks.
//! Senders never block: when the consumer falls behind, updates are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Started,
    Downloading,
    Initializing,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadProgress {
    pub agent_id: String,
    pub phase: LoadPhase,
    /// Completion in [0, 1]
    pub fraction: f32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Hands out per-agent senders that share one bounded channel
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<LoadProgress>>,
}

impl ProgressReporter {
    /// Create a reporter and the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LoadProgress>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A reporter that discards everything
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn for_agent(&self, agent_id: &str) -> ProgressSender {
        ProgressSender {
            agent_id: agent_id.to_string(),
            tx: self.tx.clone(),
        }
    }
}

/// Progress handle passed to [`crate::agent::Agent::load`]
#[derive(Debug, Clone)]
pub struct ProgressSender {
    agent_id: String,
    tx: Option<mpsc::Sender<LoadProgress>>,
}

impl ProgressSender {
    pub fn noop(agent_id: &str) -> Self {
        ProgressReporter::noop().for_agent(agent_id)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn report(&self, phase: LoadPhase, fraction: f32, message: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };

        let update = LoadProgress {
            agent_id: self.agent_id.clone(),
            phase,
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
            timestamp: Utc::now(),
        };

        if let Err(e) = tx.try_send(update) {
            trace!(agent_id = %self.agent_id, error = %e, "Dropped load progress update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_updates_are_delivered_in_order() {
        let (reporter, mut rx) = ProgressReporter::channel(8);
        let sender = reporter.for_agent("code-agent");

        sender.report(LoadPhase::Started, 0.0, "starting");
        sender.report(LoadPhase::Ready, 1.0, "ready");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.phase, LoadPhase::Started);
        assert_eq!(second.phase, LoadPhase::Ready);
        assert_eq!(second.agent_id, "code-agent");
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (reporter, mut rx) = ProgressReporter::channel(1);
        let sender = reporter.for_agent("vision-agent");

        sender.report(LoadPhase::Downloading, 0.2, "a");
        sender.report(LoadPhase::Downloading, 0.4, "b");

        assert_eq!(rx.recv().await.unwrap().message, "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fraction_is_clamped() {
        let (reporter, mut rx) = ProgressReporter::channel(2);
        reporter
            .for_agent("a")
            .report(LoadPhase::Initializing, 3.0, "x");
        assert_eq!(rx.try_recv().unwrap().fraction, 1.0);
    }

    #[test]
    fn test_noop_sender_is_silent() {
        ProgressSender::noop("a").report(LoadPhase::Failed, 0.0, "ignored");
    }
}
