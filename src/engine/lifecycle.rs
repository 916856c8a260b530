//! Request lifecycle state machine
//!
//! Every request drives its own [`LifecycleMachine`]. Transitions come from a
//! static table keyed by `(state, event)`; rows for the same key are tried in
//! order and the first whose guard holds wins. Context is only mutated by the
//! named action functions attached to the winning row.

use crate::error::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Validating,
    Routing,
    LoadingAgent,
    Inferencing,
    Success,
    Error,
    Fallback,
    Cancelled,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Validating => "validating",
            LifecycleState::Routing => "routing",
            LifecycleState::LoadingAgent => "loading_agent",
            LifecycleState::Inferencing => "inferencing",
            LifecycleState::Success => "success",
            LifecycleState::Error => "error",
            LifecycleState::Fallback => "fallback",
            LifecycleState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Success | LifecycleState::Error | LifecycleState::Cancelled
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            LifecycleState::Validating
                | LifecycleState::Routing
                | LifecycleState::LoadingAgent
                | LifecycleState::Inferencing
        )
    }

    /// Rough completion percentage for progress displays
    pub fn progress(&self) -> u8 {
        match self {
            LifecycleState::Idle => 0,
            LifecycleState::Validating => 10,
            LifecycleState::Routing => 25,
            LifecycleState::LoadingAgent => 50,
            LifecycleState::Inferencing => 75,
            LifecycleState::Success => 100,
            LifecycleState::Error => 0,
            LifecycleState::Fallback => 50,
            LifecycleState::Cancelled => 0,
        }
    }

    /// Error phase reported for failures raised in this state
    pub fn phase(&self) -> Phase {
        match self {
            LifecycleState::Idle | LifecycleState::Validating => Phase::Validating,
            LifecycleState::Routing => Phase::Routing,
            LifecycleState::LoadingAgent => Phase::AgentLoading,
            LifecycleState::Inferencing => Phase::Inferencing,
            LifecycleState::Fallback => Phase::Fallback,
            LifecycleState::Success | LifecycleState::Error | LifecycleState::Cancelled => {
                Phase::Fallback
            }
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Start { query: String, has_attachments: bool },
    ValidationPassed,
    ValidationFailed { reason: String },
    RoutingComplete { agent_id: String, confidence: f64 },
    RoutingFailed { reason: String },
    AgentLoaded,
    AgentLoadFailed { reason: String },
    InferenceComplete { output: String, confidence: f32 },
    InferenceFailed { reason: String },
    /// Route again from scratch
    Retry,
    /// Load the designated fallback agent
    UseFallback { agent_id: String },
    /// Fallback was already spent; surface the error
    FallbackExhausted { reason: String },
    Cancel,
    Reset,
}

/// Discriminant of [`LifecycleEvent`], used as the transition table key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    ValidationPassed,
    ValidationFailed,
    RoutingComplete,
    RoutingFailed,
    AgentLoaded,
    AgentLoadFailed,
    InferenceComplete,
    InferenceFailed,
    Retry,
    UseFallback,
    FallbackExhausted,
    Cancel,
    Reset,
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Start { .. } => EventKind::Start,
            LifecycleEvent::ValidationPassed => EventKind::ValidationPassed,
            LifecycleEvent::ValidationFailed { .. } => EventKind::ValidationFailed,
            LifecycleEvent::RoutingComplete { .. } => EventKind::RoutingComplete,
            LifecycleEvent::RoutingFailed { .. } => EventKind::RoutingFailed,
            LifecycleEvent::AgentLoaded => EventKind::AgentLoaded,
            LifecycleEvent::AgentLoadFailed { .. } => EventKind::AgentLoadFailed,
            LifecycleEvent::InferenceComplete { .. } => EventKind::InferenceComplete,
            LifecycleEvent::InferenceFailed { .. } => EventKind::InferenceFailed,
            LifecycleEvent::Retry => EventKind::Retry,
            LifecycleEvent::UseFallback { .. } => EventKind::UseFallback,
            LifecycleEvent::FallbackExhausted { .. } => EventKind::FallbackExhausted,
            LifecycleEvent::Cancel => EventKind::Cancel,
            LifecycleEvent::Reset => EventKind::Reset,
        }
    }

    fn reason(&self) -> Option<&str> {
        match self {
            LifecycleEvent::ValidationFailed { reason }
            | LifecycleEvent::RoutingFailed { reason }
            | LifecycleEvent::AgentLoadFailed { reason }
            | LifecycleEvent::InferenceFailed { reason }
            | LifecycleEvent::FallbackExhausted { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Per-phase durations in milliseconds. Loading and inference include retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub validation_ms: u64,
    pub routing_ms: u64,
    pub loading_ms: u64,
    pub inference_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LifecycleContext {
    pub query: String,
    /// Images or audio came with the query, so empty text is acceptable
    pub has_attachments: bool,
    pub agent_id: Option<String>,
    pub confidence: Option<f64>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// Failed tries since the last reset
    pub attempts: u32,
    /// Total tries allowed per agent before falling back
    pub max_attempts: u32,
    pub fallback_used: bool,
    pub timings: PhaseTimings,
    started_at: Option<Instant>,
    phase_started_at: Option<Instant>,
}

impl LifecycleContext {
    fn new(max_attempts: u32) -> Self {
        Self {
            query: String::new(),
            has_attachments: false,
            agent_id: None,
            confidence: None,
            output: None,
            error: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            fallback_used: false,
            timings: PhaseTimings::default(),
            started_at: None,
            phase_started_at: None,
        }
    }

    fn lap(&mut self) -> u64 {
        let now = Instant::now();
        let elapsed = self
            .phase_started_at
            .map(|t| now.duration_since(t).as_millis() as u64)
            .unwrap_or(0);
        self.phase_started_at = Some(now);
        elapsed
    }
}

type Guard = fn(&LifecycleContext) -> bool;
type Action = fn(&mut LifecycleContext, &LifecycleEvent);

struct Transition {
    from: LifecycleState,
    on: EventKind,
    guard: Option<Guard>,
    to: LifecycleState,
    actions: &'static [Action],
}

// Guards

fn is_query_valid(ctx: &LifecycleContext) -> bool {
    ctx.has_attachments || !ctx.query.trim().is_empty()
}

fn can_retry(ctx: &LifecycleContext) -> bool {
    ctx.attempts + 1 < ctx.max_attempts
}

fn fallback_available(ctx: &LifecycleContext) -> bool {
    !ctx.fallback_used
}

// Actions

fn reset_context(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    *ctx = LifecycleContext::new(ctx.max_attempts);
}

fn set_query(ctx: &mut LifecycleContext, event: &LifecycleEvent) {
    if let LifecycleEvent::Start {
        query,
        has_attachments,
    } = event
    {
        ctx.query = query.clone();
        ctx.has_attachments = *has_attachments;
    }
}

fn record_start_time(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    let now = Instant::now();
    ctx.started_at = Some(now);
    ctx.phase_started_at = Some(now);
}

fn record_validation_time(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    ctx.timings.validation_ms = ctx.lap();
}

fn set_validation_error(ctx: &mut LifecycleContext, event: &LifecycleEvent) {
    ctx.error = Some(event.reason().unwrap_or("invalid query").to_string());
}

fn set_agent(ctx: &mut LifecycleContext, event: &LifecycleEvent) {
    if let LifecycleEvent::RoutingComplete {
        agent_id,
        confidence,
    } = event
    {
        ctx.agent_id = Some(agent_id.clone());
        ctx.confidence = Some(*confidence);
    }
}

fn record_routing_time(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    ctx.timings.routing_ms += ctx.lap();
}

fn record_loading_time(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    ctx.timings.loading_ms += ctx.lap();
}

fn set_output(ctx: &mut LifecycleContext, event: &LifecycleEvent) {
    if let LifecycleEvent::InferenceComplete { output, confidence } = event {
        ctx.output = Some(output.clone());
        ctx.confidence = Some(f64::from(*confidence));
    }
}

fn record_inference_time(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    ctx.timings.inference_ms += ctx.lap();
    ctx.timings.total_ms = ctx
        .started_at
        .map(|t| t.elapsed().as_millis() as u64)
        .unwrap_or(0);
}

fn set_error(ctx: &mut LifecycleContext, event: &LifecycleEvent) {
    if let Some(reason) = event.reason() {
        ctx.error = Some(reason.to_string());
    }
}

fn increment_attempts(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    ctx.attempts += 1;
}

fn reset_attempts(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    ctx.attempts = 0;
}

fn mark_fallback_used(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    ctx.fallback_used = true;
}

fn set_fallback_agent(ctx: &mut LifecycleContext, event: &LifecycleEvent) {
    if let LifecycleEvent::UseFallback { agent_id } = event {
        ctx.agent_id = Some(agent_id.clone());
        ctx.confidence = None;
    }
    ctx.attempts = 0;
    ctx.fallback_used = true;
}

fn record_total_time(ctx: &mut LifecycleContext, _: &LifecycleEvent) {
    ctx.timings.total_ms = ctx
        .started_at
        .map(|t| t.elapsed().as_millis() as u64)
        .unwrap_or(0);
}

use EventKind as E;
use LifecycleState as S;

static TRANSITIONS: &[Transition] = &[
    // Idle
    Transition {
        from: S::Idle,
        on: E::Start,
        guard: None,
        to: S::Validating,
        actions: &[reset_context, set_query, record_start_time],
    },
    // Validating
    Transition {
        from: S::Validating,
        on: E::ValidationPassed,
        guard: Some(is_query_valid),
        to: S::Routing,
        actions: &[record_validation_time],
    },
    Transition {
        from: S::Validating,
        on: E::ValidationPassed,
        guard: None,
        to: S::Error,
        actions: &[set_validation_error, record_total_time],
    },
    Transition {
        from: S::Validating,
        on: E::ValidationFailed,
        guard: None,
        to: S::Error,
        actions: &[set_validation_error, record_total_time],
    },
    Transition {
        from: S::Validating,
        on: E::Cancel,
        guard: None,
        to: S::Cancelled,
        actions: &[record_total_time],
    },
    // Routing
    Transition {
        from: S::Routing,
        on: E::RoutingComplete,
        guard: None,
        to: S::LoadingAgent,
        actions: &[set_agent, record_routing_time],
    },
    Transition {
        from: S::Routing,
        on: E::RoutingFailed,
        guard: None,
        to: S::Error,
        actions: &[set_error, record_total_time],
    },
    Transition {
        from: S::Routing,
        on: E::Cancel,
        guard: None,
        to: S::Cancelled,
        actions: &[record_total_time],
    },
    // LoadingAgent
    Transition {
        from: S::LoadingAgent,
        on: E::AgentLoaded,
        guard: None,
        to: S::Inferencing,
        actions: &[record_loading_time],
    },
    Transition {
        from: S::LoadingAgent,
        on: E::AgentLoadFailed,
        guard: Some(can_retry),
        to: S::LoadingAgent,
        actions: &[set_error, increment_attempts],
    },
    Transition {
        from: S::LoadingAgent,
        on: E::AgentLoadFailed,
        guard: None,
        to: S::Fallback,
        actions: &[set_error, increment_attempts, record_loading_time],
    },
    Transition {
        from: S::LoadingAgent,
        on: E::Cancel,
        guard: None,
        to: S::Cancelled,
        actions: &[record_total_time],
    },
    // Inferencing
    Transition {
        from: S::Inferencing,
        on: E::InferenceComplete,
        guard: None,
        to: S::Success,
        actions: &[set_output, record_inference_time],
    },
    Transition {
        from: S::Inferencing,
        on: E::InferenceFailed,
        guard: Some(can_retry),
        to: S::Inferencing,
        actions: &[set_error, increment_attempts],
    },
    Transition {
        from: S::Inferencing,
        on: E::InferenceFailed,
        guard: None,
        to: S::Fallback,
        actions: &[set_error, increment_attempts, record_inference_time],
    },
    Transition {
        from: S::Inferencing,
        on: E::Cancel,
        guard: None,
        to: S::Cancelled,
        actions: &[record_total_time],
    },
    // Fallback
    Transition {
        from: S::Fallback,
        on: E::UseFallback,
        guard: Some(fallback_available),
        to: S::LoadingAgent,
        actions: &[set_fallback_agent],
    },
    Transition {
        from: S::Fallback,
        on: E::Retry,
        guard: Some(fallback_available),
        to: S::Routing,
        actions: &[reset_attempts, mark_fallback_used],
    },
    Transition {
        from: S::Fallback,
        on: E::FallbackExhausted,
        guard: None,
        to: S::Error,
        actions: &[set_error, record_total_time],
    },
    Transition {
        from: S::Fallback,
        on: E::Cancel,
        guard: None,
        to: S::Cancelled,
        actions: &[record_total_time],
    },
    // Terminal states
    Transition {
        from: S::Success,
        on: E::Start,
        guard: None,
        to: S::Validating,
        actions: &[reset_context, set_query, record_start_time],
    },
    Transition {
        from: S::Success,
        on: E::Reset,
        guard: None,
        to: S::Idle,
        actions: &[],
    },
    Transition {
        from: S::Error,
        on: E::Retry,
        guard: None,
        to: S::Routing,
        actions: &[reset_attempts],
    },
    Transition {
        from: S::Error,
        on: E::Reset,
        guard: None,
        to: S::Idle,
        actions: &[],
    },
    Transition {
        from: S::Cancelled,
        on: E::Reset,
        guard: None,
        to: S::Idle,
        actions: &[],
    },
];

#[derive(Debug, Clone, Error, PartialEq)]
#[error("No transition from {state} on {event:?}")]
pub struct InvalidTransition {
    pub state: LifecycleState,
    pub event: EventKind,
}

/// One request's walk through the lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleMachine {
    state: LifecycleState,
    context: LifecycleContext,
}

impl LifecycleMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: LifecycleState::Idle,
            context: LifecycleContext::new(max_attempts),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn context(&self) -> &LifecycleContext {
        &self.context
    }

    /// Whether `event` would be accepted in the current state
    pub fn can_accept(&self, event: EventKind) -> bool {
        TRANSITIONS.iter().any(|t| {
            t.from == self.state && t.on == event && t.guard.map_or(true, |g| g(&self.context))
        })
    }

    /// Apply `event`, returning the new state
    pub fn send(&mut self, event: LifecycleEvent) -> Result<LifecycleState, InvalidTransition> {
        let kind = event.kind();
        let transition = TRANSITIONS
            .iter()
            .filter(|t| t.from == self.state && t.on == kind)
            .find(|t| t.guard.map_or(true, |g| g(&self.context)))
            .ok_or(InvalidTransition {
                state: self.state,
                event: kind,
            })?;

        for action in transition.actions {
            action(&mut self.context, &event);
        }

        let from = self.state;
        self.state = transition.to;
        self.log_entry(from, kind);
        Ok(self.state)
    }

    fn log_entry(&self, from: LifecycleState, event: EventKind) {
        let ctx = &self.context;
        match self.state {
            LifecycleState::Fallback | LifecycleState::Cancelled => warn!(
                from = %from,
                to = %self.state,
                ?event,
                attempts = ctx.attempts,
                error = ctx.error.as_deref().unwrap_or(""),
                "Lifecycle transition"
            ),
            LifecycleState::LoadingAgent | LifecycleState::Inferencing if from == self.state => {
                warn!(
                    state = %self.state,
                    agent_id = ctx.agent_id.as_deref().unwrap_or(""),
                    attempts = ctx.attempts,
                    error = ctx.error.as_deref().unwrap_or(""),
                    "Retrying phase"
                )
            }
            _ => debug!(
                from = %from,
                to = %self.state,
                ?event,
                agent_id = ctx.agent_id.as_deref().unwrap_or(""),
                "Lifecycle transition"
            ),
        }
    }
}
