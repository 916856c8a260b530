//! Telemetry sink contract
//!
//! The engine reports to a [`Telemetry`] implementation after each request.
//! Calls are synchronous and must return quickly; sinks that ship data
//! elsewhere should buffer and do so off the request path.

use crate::cache::CacheStats;
use crate::engine::lifecycle::PhaseTimings;
use crate::error::OrchestratorError;
use crate::queue::QueueStats;

pub trait Telemetry: Send + Sync {
    /// A request finished successfully on `agent_id`
    fn record_phase_timings(&self, agent_id: &str, timings: &PhaseTimings);

    /// A request failed; `error` carries phase and agent enrichment
    fn record_error(&self, error: &OrchestratorError);

    fn record_cache_stats(&self, stats: &CacheStats);

    fn record_queue_stats(&self, stats: &QueueStats);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn record_phase_timings(&self, _agent_id: &str, _timings: &PhaseTimings) {}

    fn record_error(&self, _error: &OrchestratorError) {}

    fn record_cache_stats(&self, _stats: &CacheStats) {}

    fn record_queue_stats(&self, _stats: &QueueStats) {}
}
