//! Inference orchestration for locally hosted AI agents
//!
//! Routes each request to the agent best suited for it, keeps expensive agents
//! resident in a memory-bounded LRU cache, isolates failing agents behind
//! circuit breakers, bounds concurrency with a priority queue, and preloads the
//! agent the next request is likely to need.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use inference_orchestrator::{Engine, EngineConfig, InferOptions};
//!
//! # async fn run() -> Result<(), inference_orchestrator::OrchestratorError> {
//! let engine = Engine::builder(EngineConfig::default())
//!     .builtin_agents()
//!     .build()?;
//! engine.initialize().await?;
//!
//! let output = engine
//!     .infer("Write a Python function that sorts a list", InferOptions::default())
//!     .await?;
//! println!("{}: {}", output.agent_id, output.content);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod predictive;
pub mod progress;
pub mod queue;
pub mod resilience;
pub mod routing;
pub mod testing;

pub use agent::{
    Agent, AgentDescriptor, AgentError, AgentFactory, AgentInput, AgentOutput, AgentRegistry,
    Attachment, Capability,
};
pub use cache::{CacheStats, ResourceCache};
pub use config::*;
pub use engine::{Engine, EngineBuilder, EngineStats, InferOptions, LifecycleState, PhaseTimings};
pub use error::{OrchestratorError, OrchestratorResult, Phase};
pub use predictive::{Prediction, PredictionSignal, PredictiveLoader};
pub use progress::{LoadPhase, LoadProgress, ProgressReporter};
pub use queue::{EnqueueOptions, QueueStats, RequestQueue};
pub use resilience::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use routing::{HeuristicRouter, Router, RoutingContext, RoutingDecision};
