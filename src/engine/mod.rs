//! Inference engine
//!
//! ## Lifecycle (lifecycle.rs)
//!
//! Table-driven state machine that every request walks through, with retry
//! and fallback guards and per-phase timings.
//!
//! ## Collaborators (collaborators.rs)
//!
//! Guardrail and sanitizer hooks wrapped around each request.
//!
//! ## Orchestrator (orchestrator.rs)
//!
//! [`Engine`] wires the registry, router, cache, breakers, queue and
//! predictive loader together and runs requests through the lifecycle.

pub mod collaborators;
pub mod lifecycle;
pub mod orchestrator;

pub use collaborators::{
    Guardrail, GuardrailVerdict, PassthroughGuardrail, PassthroughSanitizer, PatternBlockGuardrail,
    Sanitizer,
};
pub use lifecycle::{
    LifecycleContext, LifecycleEvent, LifecycleMachine, LifecycleState, PhaseTimings,
};
pub use orchestrator::{Engine, EngineBuilder, EngineStats, InferOptions};
