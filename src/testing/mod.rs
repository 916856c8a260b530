//! Testing utilities and mock implementations
//!
//! Mock agents, classifiers and telemetry sinks for exercising the
//! orchestration layer without real inference backends.

pub mod mocks;

pub use mocks::*;
