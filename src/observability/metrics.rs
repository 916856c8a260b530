//! Thread-safe metrics collection
//!
//! [`MetricsCollector`] is a [`Telemetry`] sink built from atomic counters and
//! mutex-protected collections. It is an ordinary object owned by whoever
//! builds the engine; share it with `Arc` to read snapshots while requests run.

use super::telemetry::Telemetry;
use crate::cache::CacheStats;
use crate::engine::lifecycle::PhaseTimings;
use crate::error::OrchestratorError;
use crate::queue::QueueStats;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of recent requests kept for latency percentiles
const TIMING_WINDOW: usize = 1000;

pub struct MetricsCollector {
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    requests_cancelled: AtomicU64,
    cache_reports: AtomicU64,
    queue_reports: AtomicU64,
    started_at: u64,

    timings: Mutex<VecDeque<PhaseTimings>>,
    errors_by_kind: Mutex<HashMap<String, u64>>,
    requests_by_agent: Mutex<HashMap<String, u64>>,
    last_cache: Mutex<Option<CacheStats>>,
    last_queue: Mutex<Option<QueueStats>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_cancelled: AtomicU64::new(0),
            cache_reports: AtomicU64::new(0),
            queue_reports: AtomicU64::new(0),
            started_at: current_timestamp(),
            timings: Mutex::new(VecDeque::new()),
            errors_by_kind: Mutex::new(HashMap::new()),
            requests_by_agent: Mutex::new(HashMap::new()),
            last_cache: Mutex::new(None),
            last_queue: Mutex::new(None),
        }
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.requests_succeeded.store(0, Ordering::Relaxed);
        self.requests_failed.store(0, Ordering::Relaxed);
        self.requests_cancelled.store(0, Ordering::Relaxed);
        self.cache_reports.store(0, Ordering::Relaxed);
        self.queue_reports.store(0, Ordering::Relaxed);
        if let Ok(mut timings) = self.timings.lock() {
            timings.clear();
        }
        if let Ok(mut errors) = self.errors_by_kind.lock() {
            errors.clear();
        }
        if let Ok(mut agents) = self.requests_by_agent.lock() {
            agents.clear();
        }
    }

    /// Latency statistics over the timing window (pure function of the window)
    fn latency_statistics(window: &VecDeque<PhaseTimings>) -> LatencyMetrics {
        if window.is_empty() {
            return LatencyMetrics::default();
        }

        let mut totals: Vec<u64> = window.iter().map(|t| t.total_ms).collect();
        totals.sort_unstable();
        let count = window.len() as f64;
        let mean = |f: fn(&PhaseTimings) -> u64| window.iter().map(f).sum::<u64>() as f64 / count;

        LatencyMetrics {
            samples: window.len(),
            avg_total_ms: mean(|t| t.total_ms),
            p50_total_ms: percentile(&totals, 50.0),
            p95_total_ms: percentile(&totals, 95.0),
            p99_total_ms: percentile(&totals, 99.0),
            avg_routing_ms: mean(|t| t.routing_ms),
            avg_loading_ms: mean(|t| t.loading_ms),
            avg_inference_ms: mean(|t| t.inference_ms),
        }
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();

        let latency = self
            .timings
            .lock()
            .map(|w| Self::latency_statistics(&w))
            .unwrap_or_default();
        let errors_by_kind = self
            .errors_by_kind
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        let requests_by_agent = self
            .requests_by_agent
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();

        MetricsSnapshot {
            requests: RequestMetrics {
                succeeded: self.requests_succeeded.load(Ordering::Relaxed),
                failed: self.requests_failed.load(Ordering::Relaxed),
                cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            },
            latency,
            errors_by_kind,
            requests_by_agent,
            cache: self.last_cache.lock().ok().and_then(|c| c.clone()),
            queue: self.last_queue.lock().ok().and_then(|q| q.clone()),
            cache_reports: self.cache_reports.load(Ordering::Relaxed),
            queue_reports: self.queue_reports.load(Ordering::Relaxed),
            uptime_seconds: now.saturating_sub(self.started_at),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry for MetricsCollector {
    fn record_phase_timings(&self, agent_id: &str, timings: &PhaseTimings) {
        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut window) = self.timings.lock() {
            window.push_back(timings.clone());
            while window.len() > TIMING_WINDOW {
                window.pop_front();
            }
        }
        if let Ok(mut agents) = self.requests_by_agent.lock() {
            *agents.entry(agent_id.to_string()).or_insert(0) += 1;
        }
    }

    fn record_error(&self, error: &OrchestratorError) {
        if error.is_cancellation() {
            self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut errors) = self.errors_by_kind.lock() {
            *errors.entry(error.kind().to_string()).or_insert(0) += 1;
        }
    }

    fn record_cache_stats(&self, stats: &CacheStats) {
        self.cache_reports.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_cache.lock() {
            *last = Some(stats.clone());
        }
    }

    fn record_queue_stats(&self, stats: &QueueStats) {
        self.queue_reports.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_queue.lock() {
            *last = Some(stats.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: RequestMetrics,
    pub latency: LatencyMetrics,
    pub errors_by_kind: HashMap<String, u64>,
    pub requests_by_agent: HashMap<String, u64>,
    /// Most recent cache report
    pub cache: Option<CacheStats>,
    /// Most recent queue report
    pub queue: Option<QueueStats>,
    pub cache_reports: u64,
    pub queue_reports: u64,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestMetrics {
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyMetrics {
    pub samples: usize,
    pub avg_total_ms: f64,
    pub p50_total_ms: f64,
    pub p95_total_ms: f64,
    pub p99_total_ms: f64,
    pub avg_routing_ms: f64,
    pub avg_loading_ms: f64,
    pub avg_inference_ms: f64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
