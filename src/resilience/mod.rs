//! Resilience primitives: keyed circuit breakers and retry backoff

pub mod backoff;
pub mod breaker;
pub mod registry;

pub use backoff::Backoff;
pub use breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use registry::{breaker_key, BreakerRegistry, Operation};
