//! Mock implementations for testing
//!
//! Provides a configurable mock agent, a scripted intent classifier and a
//! telemetry sink that records everything it receives, so the orchestration
//! layer can be exercised without real inference backends.

use crate::agent::{
    Agent, AgentDescriptor, AgentError, AgentFactory, AgentInput, AgentOutput, AgentResult,
    AgentState, Capability,
};
use crate::cache::CacheStats;
use crate::engine::lifecycle::PhaseTimings;
use crate::error::OrchestratorError;
use crate::observability::Telemetry;
use crate::progress::{LoadPhase, ProgressSender};
use crate::queue::QueueStats;
use crate::routing::classifier::{Classification, ClassifierError, IntentClassifier};
use crate::routing::RoutingContext;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Call counters shared by every instance built from one [`MockAgentSpec`]
#[derive(Debug, Clone, Default)]
pub struct AgentCounters {
    inner: Arc<CounterInner>,
}

#[derive(Debug, Default)]
struct CounterInner {
    factory_calls: AtomicUsize,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    processes: AtomicUsize,
    inputs: Mutex<Vec<AgentInput>>,
}

impl AgentCounters {
    pub fn factory_calls(&self) -> usize {
        self.inner.factory_calls.load(Ordering::SeqCst)
    }

    /// Load attempts, successful or not
    pub fn loads(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.inner.unloads.load(Ordering::SeqCst)
    }

    /// Process attempts, successful or not
    pub fn processes(&self) -> usize {
        self.inner.processes.load(Ordering::SeqCst)
    }

    /// Every input passed to `process`, in call order
    pub fn inputs(&self) -> Vec<AgentInput> {
        self.inner.inputs.lock().clone()
    }
}

#[derive(Debug, Clone)]
enum Response {
    Fixed(String),
    Echo,
    Transcription(String),
}

/// Builder describing how mock agent instances behave
#[derive(Debug, Clone)]
pub struct MockAgentSpec {
    descriptor: AgentDescriptor,
    response: Response,
    fail_loads: Option<usize>,
    fail_processes: Option<usize>,
    fail_unload: bool,
    load_delay: Duration,
    slow_loads: Option<(usize, Duration)>,
    process_delay: Duration,
    counters: AgentCounters,
}

impl MockAgentSpec {
    pub fn new(id: &str) -> Self {
        Self {
            descriptor: AgentDescriptor::new(id, id).with_cost(100),
            response: Response::Fixed(format!("response from {id}")),
            fail_loads: None,
            fail_processes: None,
            fail_unload: false,
            load_delay: Duration::ZERO,
            slow_loads: None,
            process_delay: Duration::ZERO,
            counters: AgentCounters::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.descriptor.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_cost(mut self, cost_mb: u64) -> Self {
        self.descriptor.resource_cost_mb = cost_mb;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.descriptor.priority = priority;
        self
    }

    pub fn with_response(mut self, response: &str) -> Self {
        self.response = Response::Fixed(response.to_string());
        self
    }

    /// Answer with `"{id}: {input}"`
    pub fn echoing(mut self) -> Self {
        self.response = Response::Echo;
        self
    }

    /// Answer with a transcription instead of a final text
    pub fn transcribing(mut self, text: &str) -> Self {
        self.response = Response::Transcription(text.to_string());
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_loads = Some(usize::MAX);
        self
    }

    /// Fail the first `n` load attempts, then succeed
    pub fn failing_first_loads(mut self, n: usize) -> Self {
        self.fail_loads = Some(n);
        self
    }

    pub fn failing_process(mut self) -> Self {
        self.fail_processes = Some(usize::MAX);
        self
    }

    /// Fail the first `n` process attempts, then succeed
    pub fn failing_first_processes(mut self, n: usize) -> Self {
        self.fail_processes = Some(n);
        self
    }

    pub fn failing_unload(mut self) -> Self {
        self.fail_unload = true;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Take `delay` for each of the first `n` load attempts, then load normally
    pub fn with_slow_first_loads(mut self, n: usize, delay: Duration) -> Self {
        self.slow_loads = Some((n, delay));
        self
    }

    pub fn with_process_delay(mut self, delay: Duration) -> Self {
        self.process_delay = delay;
        self
    }

    pub fn descriptor(&self) -> AgentDescriptor {
        self.descriptor.clone()
    }

    pub fn counters(&self) -> AgentCounters {
        self.counters.clone()
    }

    pub fn build(&self) -> MockAgent {
        MockAgent {
            spec: self.clone(),
            state: Mutex::new(AgentState::Unloaded),
        }
    }

    /// Factory that counts its invocations
    pub fn factory(&self) -> AgentFactory {
        let spec = self.clone();
        Arc::new(move || -> Box<dyn Agent> {
            spec.counters
                .inner
                .factory_calls
                .fetch_add(1, Ordering::SeqCst);
            Box::new(spec.build())
        })
    }
}

pub struct MockAgent {
    spec: MockAgentSpec,
    state: Mutex<AgentState>,
}

#[async_trait]
impl Agent for MockAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.spec.descriptor
    }

    fn state(&self) -> AgentState {
        *self.state.lock()
    }

    async fn load(&self, progress: &ProgressSender) -> AgentResult<()> {
        let attempt = self.spec.counters.inner.loads.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock() = AgentState::Loading;
        progress.report(LoadPhase::Initializing, 0.5, "mock load");

        if !self.spec.load_delay.is_zero() {
            tokio::time::sleep(self.spec.load_delay).await;
        }
        if let Some((n, delay)) = self.spec.slow_loads {
            if attempt <= n {
                tokio::time::sleep(delay).await;
            }
        }

        if self.spec.fail_loads.is_some_and(|n| attempt <= n) {
            *self.state.lock() = AgentState::Error;
            return Err(AgentError::load_failed("mock load failure"));
        }

        *self.state.lock() = AgentState::Ready;
        Ok(())
    }

    async fn unload(&self) -> AgentResult<()> {
        self.spec.counters.inner.unloads.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = AgentState::Unloaded;
        if self.spec.fail_unload {
            return Err(AgentError::unload_failed("mock unload failure"));
        }
        Ok(())
    }

    async fn process(&self, input: AgentInput) -> AgentResult<AgentOutput> {
        let counters = &self.spec.counters.inner;
        let attempt = counters.processes.fetch_add(1, Ordering::SeqCst) + 1;
        counters.inputs.lock().push(input.clone());

        if !self.spec.process_delay.is_zero() {
            tokio::time::sleep(self.spec.process_delay).await;
        }

        if self.spec.fail_processes.is_some_and(|n| attempt <= n) {
            return Err(AgentError::processing_failed("mock process failure"));
        }

        let id = &self.spec.descriptor.id;
        let output = match &self.spec.response {
            Response::Fixed(text) => AgentOutput::text(id, text),
            Response::Echo => AgentOutput::text(id, format!("{id}: {}", input.content)),
            Response::Transcription(text) => AgentOutput::transcription(id, text),
        };
        Ok(output)
    }
}

/// Intent classifier that returns a scripted answer
pub struct MockClassifier {
    result: Result<Classification, ClassifierError>,
    available: bool,
    calls: AtomicUsize,
}

impl MockClassifier {
    pub fn returning(capability: Capability, confidence: f64) -> Self {
        Self {
            result: Ok(Classification {
                capability,
                confidence,
                reasoning: "mock classification".to_string(),
            }),
            available: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            result: Err(ClassifierError::Failed("mock classifier failure".to_string())),
            available: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::failing()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntentClassifier for MockClassifier {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn classify(
        &self,
        _query: &str,
        _context: &RoutingContext,
    ) -> Result<Classification, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// Telemetry sink that keeps everything it is sent
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    timings: Mutex<Vec<(String, PhaseTimings)>>,
    errors: Mutex<Vec<String>>,
    cache_reports: AtomicUsize,
    queue_reports: AtomicUsize,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timings(&self) -> Vec<(String, PhaseTimings)> {
        self.timings.lock().clone()
    }

    /// Recorded errors rendered with `Display`
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn cache_reports(&self) -> usize {
        self.cache_reports.load(Ordering::SeqCst)
    }

    pub fn queue_reports(&self) -> usize {
        self.queue_reports.load(Ordering::SeqCst)
    }
}

impl Telemetry for RecordingTelemetry {
    fn record_phase_timings(&self, agent_id: &str, timings: &PhaseTimings) {
        self.timings
            .lock()
            .push((agent_id.to_string(), timings.clone()));
    }

    fn record_error(&self, error: &OrchestratorError) {
        self.errors.lock().push(error.to_string());
    }

    fn record_cache_stats(&self, _stats: &CacheStats) {
        self.cache_reports.fetch_add(1, Ordering::SeqCst);
    }

    fn record_queue_stats(&self, _stats: &QueueStats) {
        self.queue_reports.fetch_add(1, Ordering::SeqCst);
    }
}
