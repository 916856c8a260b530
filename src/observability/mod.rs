//! Observability: structured logging, the telemetry sink contract, and an
//! in-process metrics collector.

pub mod logging;
pub mod metrics;
pub mod telemetry;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{LatencyMetrics, MetricsCollector, MetricsSnapshot, RequestMetrics};
pub use telemetry::{NoopTelemetry, Telemetry};

// Span macros for structured logging
pub use logging::{agent_span, cache_span, request_span};
