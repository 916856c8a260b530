//! Breakers keyed by agent and operation
//!
//! Each `(agent_id, operation)` pair gets its own breaker, created on first use
//! and reused afterwards, so a failing vision backend never trips the breaker
//! guarding code inference.

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::BreakersSection;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Load,
    Inference,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Load => "load",
            Operation::Inference => "inference",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn breaker_key(agent_id: &str, operation: Operation) -> String {
    format!("{agent_id}:{operation}")
}

pub struct BreakerRegistry {
    settings: BreakersSection,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakersSection) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// The breaker for this pair, created with the operation's settings on first use
    pub fn get_or_create(&self, agent_id: &str, operation: Operation) -> Arc<CircuitBreaker> {
        let key = breaker_key(agent_id, operation);

        if let Some(existing) = self.breakers.read().get(&key) {
            return existing.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(breaker = %key, "Creating circuit breaker");
                let settings = match operation {
                    Operation::Load => self.settings.load.clone(),
                    Operation::Inference => self.settings.inference.clone(),
                };
                Arc::new(CircuitBreaker::new(key.clone(), settings))
            })
            .clone()
    }

    pub fn get(&self, agent_id: &str, operation: Operation) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .get(&breaker_key(agent_id, operation))
            .cloned()
    }

    /// Snapshots of every breaker, sorted by key
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}
