//! Keyed circuit breaker
//!
//! Closed → Open after `failure_threshold` consecutive failures. Open rejects calls
//! until `reset_timeout` has elapsed, then lets exactly one trial through
//! (HalfOpen). A successful trial closes the circuit and clears the failure count;
//! a failed trial re-opens it and restarts the timer.
//!
//! Every guarded call runs under `call_timeout`; expiry counts as a failure.
//! Cancellations and rejections from nested breakers are neutral: they are
//! neither successes nor failures.

use crate::config::BreakerSettings;
use crate::error::{OrchestratorError, OrchestratorResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    const fn valid_transitions(&self) -> &'static [CircuitState] {
        match self {
            CircuitState::Closed => &[CircuitState::Open],
            CircuitState::Open => &[CircuitState::HalfOpen],
            CircuitState::HalfOpen => &[CircuitState::Closed, CircuitState::Open],
        }
    }

    fn can_transition_to(&self, target: CircuitState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    status: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejections: u64,
}

impl BreakerState {
    fn transition_to(&mut self, next: CircuitState) {
        debug_assert!(
            self.status.can_transition_to(next),
            "Invalid circuit state transition: {:?} -> {:?}",
            self.status,
            next
        );
        self.status = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Diagnostics view of one breaker
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub open_for_ms: Option<u64>,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
}

pub struct CircuitBreaker {
    key: String,
    settings: BreakerSettings,
    state: Mutex<BreakerState>,
}

/// Frees the half-open trial slot if the guarded future is dropped mid-call
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.permit == Permit::Trial {
            self.breaker.state.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            key: key.into(),
            settings,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().status
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Run `f` through the breaker.
    ///
    /// Rejected immediately with [`OrchestratorError::CircuitOpen`] while open.
    pub async fn execute<T, F, Fut>(&self, f: F) -> OrchestratorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        let permit = self.acquire()?;
        let _guard = TrialGuard {
            breaker: self,
            permit,
        };

        let call_timeout = self.settings.call_timeout();
        let result = match timeout(call_timeout, f()).await {
            Ok(result) => result,
            Err(_) => {
                self.state.lock().timeouts += 1;
                Err(OrchestratorError::Timeout {
                    timeout_ms: call_timeout.as_millis() as u64,
                })
            }
        };

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.is_cancellation() || e.is_circuit_open() => Outcome::Neutral,
            Err(_) => Outcome::Failure,
        };
        self.record(permit, outcome);

        result
    }

    /// Like [`execute`](Self::execute), but when the circuit is open or the call
    /// fails, `fallback` is invoked with the error instead of propagating it.
    /// Cancellations always propagate.
    pub async fn execute_with_fallback<T, F, Fut, G, GFut>(
        &self,
        f: F,
        fallback: G,
    ) -> OrchestratorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
        G: FnOnce(OrchestratorError) -> GFut,
        GFut: Future<Output = OrchestratorResult<T>>,
    {
        match self.execute(f).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                debug!(breaker = %self.key, error = %e, "Using breaker fallback");
                fallback(e).await
            }
        }
    }

    /// Force the circuit closed and clear the failure count
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.status = CircuitState::Closed;
        state.failure_count = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.lock();
        BreakerSnapshot {
            key: self.key.clone(),
            state: state.status,
            failure_count: state.failure_count,
            open_for_ms: state
                .opened_at
                .map(|at| at.elapsed().as_millis() as u64),
            successes: state.successes,
            failures: state.failures,
            timeouts: state.timeouts,
            rejections: state.rejections,
        }
    }

    fn acquire(&self) -> OrchestratorResult<Permit> {
        let mut state = self.state.lock();
        match state.status {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.settings.reset_timeout() {
                    state.transition_to(CircuitState::HalfOpen);
                    state.trial_in_flight = true;
                    debug!(breaker = %self.key, "Circuit half-open, allowing trial call");
                    Ok(Permit::Trial)
                } else {
                    state.rejections += 1;
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    state.rejections += 1;
                    Err(self.open_error())
                } else {
                    // Previous trial was abandoned without an outcome
                    state.trial_in_flight = true;
                    Ok(Permit::Trial)
                }
            }
        }
    }

    fn record(&self, permit: Permit, outcome: Outcome) {
        let mut state = self.state.lock();
        match outcome {
            Outcome::Neutral => {}
            Outcome::Success => {
                state.successes += 1;
                match (permit, state.status) {
                    (Permit::Trial, CircuitState::HalfOpen) => {
                        state.transition_to(CircuitState::Closed);
                        state.failure_count = 0;
                        state.opened_at = None;
                        info!(breaker = %self.key, "Circuit closed after successful trial");
                    }
                    (_, CircuitState::Closed) => state.failure_count = 0,
                    _ => {}
                }
            }
            Outcome::Failure => {
                state.failures += 1;
                state.failure_count += 1;
                match (permit, state.status) {
                    (Permit::Trial, CircuitState::HalfOpen) => {
                        state.transition_to(CircuitState::Open);
                        state.opened_at = Some(Instant::now());
                        warn!(breaker = %self.key, "Trial call failed, circuit re-opened");
                    }
                    (_, CircuitState::Closed)
                        if state.failure_count >= self.settings.failure_threshold =>
                    {
                        state.transition_to(CircuitState::Open);
                        state.opened_at = Some(Instant::now());
                        warn!(
                            breaker = %self.key,
                            failures = state.failure_count,
                            "Circuit opened"
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    fn open_error(&self) -> OrchestratorError {
        OrchestratorError::CircuitOpen {
            key: self.key.clone(),
        }
    }
}
