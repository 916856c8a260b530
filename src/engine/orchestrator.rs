//! The engine: composition root and request pipeline
//!
//! Flow for one request:
//!
//! 1. queue admission (bounded concurrency, priority ordered)
//! 2. validation (length guard and guardrail)
//! 3. routing (or a caller-forced agent)
//! 4. agent loading through the resource cache, behind a per-agent load breaker
//! 5. inference behind a per-agent inference breaker
//! 6. output sanitization and an async predictive preload hint
//!
//! Loading and inference failures retry in place with exponential backoff up
//! to `max_attempts`, then fall back once: either to the configured fallback
//! agent or by routing again without the failed agent. Every error leaving the
//! engine carries the phase and agent it happened in.

use super::collaborators::{
    Guardrail, GuardrailVerdict, PassthroughGuardrail, PassthroughSanitizer, Sanitizer,
};
use super::lifecycle::{LifecycleEvent, LifecycleMachine, LifecycleState};
use crate::agent::builtin::builtin_agents;
use crate::agent::{
    Agent, AgentDescriptor, AgentFactory, AgentInput, AgentOutput, AgentRegistry,
    Attachment, Capability,
};
use crate::cache::{CacheStats, ResourceCache};
use crate::config::{EngineConfig, FallbackPolicy};
use crate::error::{OrchestratorError, OrchestratorResult, Phase};
use crate::observability::{NoopTelemetry, Telemetry};
use crate::predictive::{PredictionSignal, PredictiveLoader};
use crate::progress::ProgressReporter;
use crate::queue::{EnqueueOptions, QueueStats, RequestQueue};
use crate::resilience::{Backoff, BreakerRegistry, BreakerSnapshot, Operation};
use crate::routing::{HeuristicRouter, Router, RoutingContext, RoutingDecision};
use crate::{agent_span, request_span};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Per-request options for [`Engine::infer`]
#[derive(Debug, Clone, Default)]
pub struct InferOptions {
    /// Skip routing and use this agent
    pub force_agent: Option<String>,
    /// Queue priority, higher first
    pub priority: i32,
    pub images: Vec<Attachment>,
    pub audio: Option<Attachment>,
    /// Prior conversation turns, oldest first
    pub history: Vec<String>,
    pub ambient_context: Option<String>,
    pub preferred_capability: Option<Capability>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Trip to abandon the request
    pub cancel: Option<CancellationToken>,
    pub metadata: Option<serde_json::Value>,
}

impl InferOptions {
    pub fn forced(agent_id: impl Into<String>) -> Self {
        Self {
            force_agent: Some(agent_id.into()),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_audio(mut self, audio: Attachment) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_image(mut self, image: Attachment) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.preferred_capability = Some(capability);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn has_attachments(&self) -> bool {
        self.audio.is_some() || !self.images.is_empty()
    }

    fn routing_context(&self) -> RoutingContext {
        RoutingContext {
            has_images: !self.images.is_empty(),
            has_audio: self.audio.is_some(),
            preferred_capability: self.preferred_capability,
            history: self.history.clone(),
            excluded_agents: Vec::new(),
        }
    }

    fn agent_input(&self, query: &str) -> AgentInput {
        AgentInput {
            content: query.to_string(),
            history: self.history.clone(),
            ambient_context: self.ambient_context.clone(),
            images: self.images.clone(),
            audio: self.audio.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    /// Options for answering a transcription: the audio has been consumed
    fn for_transcript(&self) -> Self {
        Self {
            force_agent: None,
            audio: None,
            preferred_capability: None,
            ..self.clone()
        }
    }
}

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub ready: bool,
    pub registered_agents: Vec<String>,
    pub cache: CacheStats,
    pub queue: QueueStats,
    pub breakers: Vec<BreakerSnapshot>,
    pub recent_agents: Vec<String>,
}

/// Queue token and caller token, either of which aborts the request
#[derive(Clone)]
struct CancelSignal {
    queue: CancellationToken,
    caller: CancellationToken,
}

impl CancelSignal {
    fn is_cancelled(&self) -> bool {
        self.queue.is_cancelled() || self.caller.is_cancelled()
    }

    async fn cancelled(&self) {
        tokio::select! {
            _ = self.queue.cancelled() => {}
            _ = self.caller.cancelled() => {}
        }
    }

    /// Run `fut` unless cancellation wins first
    async fn guard<T, F>(&self, fut: F) -> OrchestratorResult<T>
    where
        F: Future<Output = OrchestratorResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(OrchestratorError::Cancelled),
            result = fut => result,
        }
    }
}

pub struct EngineBuilder {
    config: EngineConfig,
    router: Option<Arc<dyn Router>>,
    guardrail: Arc<dyn Guardrail>,
    sanitizer: Arc<dyn Sanitizer>,
    telemetry: Arc<dyn Telemetry>,
    progress: ProgressReporter,
    agents: Vec<(AgentDescriptor, AgentFactory)>,
}

impl EngineBuilder {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            router: None,
            guardrail: Arc::new(PassthroughGuardrail),
            sanitizer: Arc::new(PassthroughSanitizer),
            telemetry: Arc::new(NoopTelemetry),
            progress: ProgressReporter::noop(),
            agents: Vec::new(),
        }
    }

    /// Replace the default heuristic router
    pub fn router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn guardrail(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrail = guardrail;
        self
    }

    pub fn sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Ignored when telemetry is disabled in the configuration
    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn agent(mut self, descriptor: AgentDescriptor, factory: AgentFactory) -> Self {
        self.agents.push((descriptor, factory));
        self
    }

    /// Register the simulated built-in roster
    pub fn builtin_agents(mut self) -> Self {
        self.agents.extend(builtin_agents());
        self
    }

    pub fn build(self) -> OrchestratorResult<Engine> {
        self.config.validate()?;

        let config = self.config;
        let router: Arc<dyn Router> = match self.router {
            Some(router) => router,
            None => Arc::new(HeuristicRouter::new(config.routing.clone())),
        };
        let telemetry: Arc<dyn Telemetry> = if config.telemetry.enabled {
            self.telemetry
        } else {
            Arc::new(NoopTelemetry)
        };
        let backoff = Backoff::exponential(
            Duration::from_millis(config.engine.retry_backoff_ms),
            Duration::from_millis(config.engine.max_backoff_ms),
        );

        let engine = Engine {
            inner: Arc::new(EngineInner {
                registry: AgentRegistry::new(),
                router,
                cache: ResourceCache::new(&config.cache).with_progress(self.progress),
                breakers: BreakerRegistry::new(config.breakers.clone()),
                queue: RequestQueue::new(&config.queue)?,
                predictive: Arc::new(PredictiveLoader::new(config.predictive.clone())),
                guardrail: self.guardrail,
                sanitizer: self.sanitizer,
                telemetry,
                ready: AtomicBool::new(false),
                backoff,
                config,
            }),
        };

        for (descriptor, factory) in self.agents {
            engine.register_agent(descriptor, factory)?;
        }
        Ok(engine)
    }
}

/// Routes requests to agents, keeping the heavy ones cached
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    registry: AgentRegistry,
    router: Arc<dyn Router>,
    cache: ResourceCache,
    breakers: BreakerRegistry,
    queue: RequestQueue,
    predictive: Arc<PredictiveLoader>,
    guardrail: Arc<dyn Guardrail>,
    sanitizer: Arc<dyn Sanitizer>,
    telemetry: Arc<dyn Telemetry>,
    ready: AtomicBool,
    backoff: Backoff,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Make an agent routable. Re-registering an id replaces its factory;
    /// an already-resident instance stays until evicted.
    pub fn register_agent(
        &self,
        descriptor: AgentDescriptor,
        factory: AgentFactory,
    ) -> OrchestratorResult<()> {
        crate::config::validate_agent_id(&descriptor.id)?;

        let inner = &self.inner;
        info!(agent_id = %descriptor.id, cost_mb = descriptor.resource_cost_mb, "Registering agent");
        inner.router.register_agent(descriptor.clone());
        inner.registry.register(descriptor, factory);
        inner.predictive.set_available_agents(inner.registry.ids());
        Ok(())
    }

    /// Mark the engine ready and hook up predictive preloading. Safe to call twice.
    pub async fn initialize(&self) -> OrchestratorResult<()> {
        let inner = &self.inner;
        if inner.ready.load(Ordering::SeqCst) {
            debug!("Engine already initialized");
            return Ok(());
        }

        let fallback = &inner.config.engine.fallback_agent;
        if inner.config.engine.fallback_policy == FallbackPolicy::FallbackAgent
            && !inner.registry.contains(fallback)
        {
            warn!(fallback_agent = %fallback, "Fallback agent is not registered; failures will not degrade");
        }

        let weak = Arc::downgrade(&self.inner);
        inner.predictive.on_preload(Arc::new(move |agent_id: String| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.preload(&agent_id).await,
                    None => Ok(()),
                }
            }
            .boxed()
        }));

        inner.cache.reopen();
        inner.ready.store(true, Ordering::SeqCst);
        info!(
            agents = inner.registry.len(),
            memory_budget_mb = inner.config.cache.memory_budget_mb,
            max_agents = inner.config.cache.max_agents,
            "Engine initialized"
        );
        Ok(())
    }

    /// Answer `query`, routing it to the best agent
    pub async fn infer(&self, query: &str, options: InferOptions) -> OrchestratorResult<AgentOutput> {
        let request_id = Uuid::new_v4();
        let span = request_span!(
            request_id = %request_id,
            priority = options.priority,
            forced = options.force_agent.as_deref().unwrap_or("")
        );

        async move {
            let inner = &self.inner;
            let result = if inner.ready.load(Ordering::SeqCst) {
                inner.admit(query.to_string(), options).await
            } else {
                Err(OrchestratorError::NotInitialized)
            };

            match &result {
                Ok(output) => {
                    debug!(agent_id = %output.agent_id, "Request completed");
                    if let Some(timings) = &output.timings {
                        inner.telemetry.record_phase_timings(&output.agent_id, timings);
                    }
                    inner.predictive.spawn_hint(PredictionSignal {
                        current_agent: Some(output.agent_id.clone()),
                        hint_text: Some(query.to_string()),
                    });
                }
                Err(e) => {
                    warn!(error = %e, kind = e.kind(), "Request failed");
                    inner.telemetry.record_error(e);
                }
            }
            inner.telemetry.record_cache_stats(&inner.cache.stats());
            inner.telemetry.record_queue_stats(&inner.queue.stats());

            result
        }
        .instrument(span)
        .await
    }

    /// Stop accepting work, cancel what is queued or running, and unload every
    /// resident agent. Later `infer` calls fail with `NotInitialized`.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let was_ready = inner.ready.swap(false, Ordering::SeqCst);

        inner.predictive.abort_pending();
        inner.queue.cancel_all();
        let unloaded = inner.cache.close().await;

        if was_ready {
            info!(unloaded, "Engine shut down");
        } else {
            debug!(unloaded, "Shutdown on an engine that was not running");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn available_agents(&self) -> Vec<AgentDescriptor> {
        self.inner.registry.descriptors()
    }

    /// Ids of agents currently loaded, least recently used first
    pub fn resident_agents(&self) -> Vec<String> {
        self.inner.cache.resident_ids()
    }

    pub fn predictive(&self) -> &PredictiveLoader {
        &self.inner.predictive
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        EngineStats {
            ready: self.is_ready(),
            registered_agents: inner.registry.ids(),
            cache: inner.cache.stats(),
            queue: inner.queue.stats(),
            breakers: inner.breakers.snapshot_all(),
            recent_agents: inner.predictive.recent_agents(),
        }
    }
}

impl EngineInner {
    async fn admit(self: &Arc<Self>, query: String, options: InferOptions) -> OrchestratorResult<AgentOutput> {
        let caller = options.cancel.clone().unwrap_or_default();
        let enqueue = EnqueueOptions {
            priority: options.priority,
            metadata: options.metadata.clone(),
            cancel: Some(caller.clone()),
        };

        let this = Arc::clone(self);
        let result = self
            .queue
            .enqueue(
                move |token| async move {
                    let cancel = CancelSignal {
                        queue: token,
                        caller,
                    };
                    this.run_request(query, options, &cancel, 0).await
                },
                enqueue,
            )
            .await;

        // Errors from inside the pipeline are already enriched
        result.map_err(|e| match e.phase() {
            Some(_) => e,
            None => e.in_phase(Phase::Admission, None),
        })
    }

    /// One pass through the lifecycle. Recurses, without re-entering the queue,
    /// when an agent returns a transcription that still needs answering.
    fn run_request<'a>(
        self: &'a Arc<Self>,
        query: String,
        options: InferOptions,
        cancel: &'a CancelSignal,
        depth: u32,
    ) -> BoxFuture<'a, OrchestratorResult<AgentOutput>> {
        async move {
            let mut machine = LifecycleMachine::new(self.config.engine.max_attempts);
            self.advance(
                &mut machine,
                LifecycleEvent::Start {
                    query: query.clone(),
                    has_attachments: options.has_attachments(),
                },
            );

            // Validating
            let query = match self.validate(&query).await {
                Ok(query) => query,
                Err(e) => {
                    self.advance(
                        &mut machine,
                        LifecycleEvent::ValidationFailed {
                            reason: e.to_string(),
                        },
                    );
                    return Err(e.in_phase(Phase::Validating, None));
                }
            };
            self.advance(&mut machine, LifecycleEvent::ValidationPassed);
            if machine.state() == LifecycleState::Error {
                return Err(OrchestratorError::invalid_input("query is empty")
                    .in_phase(Phase::Validating, None));
            }
            self.checkpoint(&mut machine, cancel, None)?;

            // Routing
            let mut context = options.routing_context();
            let decision = match self.decide(&query, &options, &context).await {
                Ok(decision) => decision,
                Err(e) => {
                    self.advance(
                        &mut machine,
                        LifecycleEvent::RoutingFailed {
                            reason: e.to_string(),
                        },
                    );
                    let agent_id = e.agent_id().map(str::to_string);
                    return Err(e.in_phase(Phase::Routing, agent_id.as_deref()));
                }
            };
            info!(
                agent_id = %decision.selected_agent_id,
                confidence = decision.confidence,
                reasoning = %decision.reasoning,
                depth,
                "Routed request"
            );
            let mut agent_id = decision.selected_agent_id.clone();
            self.advance(
                &mut machine,
                LifecycleEvent::RoutingComplete {
                    agent_id: agent_id.clone(),
                    confidence: decision.confidence,
                },
            );
            self.checkpoint(&mut machine, cancel, Some(&agent_id))?;

            let input = options.agent_input(&query);
            let mut agent: Option<Arc<dyn Agent>> = None;
            let mut original: Option<OrchestratorError> = None;

            let mut output = loop {
                match machine.state() {
                    LifecycleState::LoadingAgent => {
                        match cancel.guard(self.load_agent(&agent_id)).await {
                            Ok(loaded) => {
                                agent = Some(loaded);
                                self.advance(&mut machine, LifecycleEvent::AgentLoaded);
                            }
                            Err(e) if e.is_cancellation() => {
                                return Err(self.cancelled(&mut machine, Some(&agent_id)));
                            }
                            Err(e) => {
                                warn!(agent_id = %agent_id, error = %e, "Agent load failed");
                                let reason = e.to_string();
                                original
                                    .get_or_insert_with(|| e.in_phase(Phase::AgentLoading, Some(&agent_id)));
                                self.advance(&mut machine, LifecycleEvent::AgentLoadFailed { reason });
                                if machine.state() == LifecycleState::LoadingAgent {
                                    self.pause(&mut machine, cancel, &agent_id).await?;
                                }
                            }
                        }
                    }
                    LifecycleState::Inferencing => {
                        self.checkpoint(&mut machine, cancel, Some(&agent_id))?;
                        let Some(loaded) = agent.clone() else {
                            // Unreachable through the table; treat as a failed load
                            self.advance(
                                &mut machine,
                                LifecycleEvent::InferenceFailed {
                                    reason: "agent not loaded".to_string(),
                                },
                            );
                            continue;
                        };

                        match cancel.guard(self.process(&loaded, input.clone())).await {
                            Ok(output) => {
                                self.advance(
                                    &mut machine,
                                    LifecycleEvent::InferenceComplete {
                                        output: output.content.clone(),
                                        confidence: output.confidence,
                                    },
                                );
                                break output;
                            }
                            Err(e) if e.is_cancellation() => {
                                return Err(self.cancelled(&mut machine, Some(&agent_id)));
                            }
                            Err(e) => {
                                warn!(agent_id = %agent_id, error = %e, "Inference failed");
                                let reason = e.to_string();
                                original
                                    .get_or_insert_with(|| e.in_phase(Phase::Inferencing, Some(&agent_id)));
                                self.advance(&mut machine, LifecycleEvent::InferenceFailed { reason });
                                if machine.state() == LifecycleState::Inferencing {
                                    self.pause(&mut machine, cancel, &agent_id).await?;
                                }
                            }
                        }
                    }
                    LifecycleState::Fallback => {
                        let cause = original
                            .take()
                            .unwrap_or_else(|| OrchestratorError::inference_failure(&agent_id, "unknown failure"));

                        match self.fall_back(&mut machine, &query, &mut context, &agent_id).await {
                            Some(next) => {
                                warn!(from = %agent_id, to = %next, error = %cause, "Falling back");
                                agent_id = next;
                                agent = None;
                                original = Some(cause);
                            }
                            None => {
                                if machine.state() == LifecycleState::Fallback {
                                    self.advance(
                                        &mut machine,
                                        LifecycleEvent::FallbackExhausted {
                                            reason: cause.to_string(),
                                        },
                                    );
                                }
                                return Err(cause.in_phase(Phase::Fallback, None));
                            }
                        }
                    }
                    other => {
                        // Every other state is left before or inside this loop
                        return Err(OrchestratorError::routing_failure(format!(
                            "unexpected lifecycle state {other}"
                        ))
                        .in_phase(other.phase(), Some(&agent_id)));
                    }
                }
            };

            output.content = self.sanitizer.sanitize(&output.content);
            let timings = machine.context().timings.clone();
            if output.processing_time_ms == 0 {
                output.processing_time_ms = timings.inference_ms;
            }
            output.timings = Some(timings);
            self.predictive.record_usage(&output.agent_id);

            if output.is_transcription() {
                if depth < self.config.engine.max_reroute_depth {
                    info!(
                        agent_id = %output.agent_id,
                        depth = depth + 1,
                        chars = output.content.len(),
                        "Resubmitting transcription as a new query"
                    );
                    let transcript = output.content.clone();
                    return self
                        .run_request(transcript, options.for_transcript(), cancel, depth + 1)
                        .await;
                }
                debug!(depth, "Re-route depth reached, returning transcription");
            }

            Ok(output)
        }
        .boxed()
    }

    /// Length guard, then the guardrail. Returns the text to route.
    async fn validate(&self, query: &str) -> OrchestratorResult<String> {
        let max = self.config.engine.max_query_chars;
        if query.chars().count() > max {
            return Err(OrchestratorError::invalid_input(format!(
                "query exceeds {max} characters"
            )));
        }

        match self.guardrail.validate(query).await {
            GuardrailVerdict::Pass => Ok(query.to_string()),
            GuardrailVerdict::Sanitize { text } => {
                debug!(guardrail = self.guardrail.name(), "Query sanitized");
                Ok(text)
            }
            GuardrailVerdict::Block { reasons } => {
                warn!(guardrail = self.guardrail.name(), ?reasons, "Query blocked");
                Err(OrchestratorError::refused(reasons.join("; ")))
            }
        }
    }

    async fn decide(
        &self,
        query: &str,
        options: &InferOptions,
        context: &RoutingContext,
    ) -> OrchestratorResult<RoutingDecision> {
        let decision = match &options.force_agent {
            Some(forced) => RoutingDecision::forced(forced.clone()),
            None => self.router.route_with_context(query, context).await?,
        };

        if !self.registry.contains(&decision.selected_agent_id) {
            return Err(OrchestratorError::agent_not_found(&decision.selected_agent_id));
        }
        Ok(decision)
    }

    /// Pick the next agent after retries ran out, moving the machine back to
    /// `LoadingAgent`. `None` when no fallback is possible.
    async fn fall_back(
        &self,
        machine: &mut LifecycleMachine,
        query: &str,
        context: &mut RoutingContext,
        failed_agent: &str,
    ) -> Option<String> {
        if machine.context().fallback_used {
            return None;
        }

        match self.config.engine.fallback_policy {
            FallbackPolicy::FallbackAgent => {
                let fallback = self.config.engine.fallback_agent.clone();
                if fallback == failed_agent || !self.registry.contains(&fallback) {
                    return None;
                }
                self.advance(
                    machine,
                    LifecycleEvent::UseFallback {
                        agent_id: fallback.clone(),
                    },
                );
                Some(fallback)
            }
            FallbackPolicy::Reroute => {
                context.excluded_agents.push(failed_agent.to_string());
                self.advance(machine, LifecycleEvent::Retry);

                let decision = match self.router.route_with_context(query, context).await {
                    Ok(decision) if self.registry.contains(&decision.selected_agent_id) => decision,
                    Ok(decision) => {
                        self.advance(
                            machine,
                            LifecycleEvent::RoutingFailed {
                                reason: format!("agent {} not registered", decision.selected_agent_id),
                            },
                        );
                        return None;
                    }
                    Err(e) => {
                        self.advance(
                            machine,
                            LifecycleEvent::RoutingFailed {
                                reason: e.to_string(),
                            },
                        );
                        return None;
                    }
                };

                let next = decision.selected_agent_id.clone();
                self.advance(
                    machine,
                    LifecycleEvent::RoutingComplete {
                        agent_id: next.clone(),
                        confidence: decision.confidence,
                    },
                );
                Some(next)
            }
        }
    }

    async fn load_agent(&self, agent_id: &str) -> OrchestratorResult<Arc<dyn Agent>> {
        let registered = self
            .registry
            .get(agent_id)
            .ok_or_else(|| OrchestratorError::agent_not_found(agent_id))?;
        let breaker = self.breakers.get_or_create(agent_id, Operation::Load);
        let factory = registered.factory;

        breaker
            .execute(|| async {
                self.cache
                    .get_or_load(agent_id, &factory)
                    .await
                    .map_err(|e| OrchestratorError::load_failure(e.agent_id, e.cause))
            })
            .instrument(agent_span!(agent_id = %agent_id, operation = "load"))
            .await
    }

    async fn process(&self, agent: &Arc<dyn Agent>, input: AgentInput) -> OrchestratorResult<AgentOutput> {
        let agent_id = agent.id().to_string();
        let breaker = self.breakers.get_or_create(&agent_id, Operation::Inference);

        breaker
            .execute(|| async {
                agent
                    .process(input)
                    .await
                    .map_err(|e| OrchestratorError::inference_failure(&agent_id, e))
            })
            .instrument(agent_span!(agent_id = %agent_id, operation = "process"))
            .await
    }

    /// Background preload of a predicted agent. Never evicts anything.
    async fn preload(&self, agent_id: &str) -> OrchestratorResult<()> {
        if !self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.cache.contains(agent_id) || self.cache.is_loading(agent_id) {
            return Ok(());
        }
        let Some(registered) = self.registry.get(agent_id) else {
            debug!(agent_id = %agent_id, "Predicted agent is not registered");
            return Ok(());
        };
        if !self
            .cache
            .has_capacity_for(registered.descriptor.resource_cost_mb)
        {
            debug!(agent_id = %agent_id, "Skipping preload that would evict");
            return Ok(());
        }

        self.cache
            .get_or_load(agent_id, &registered.factory)
            .await
            .map_err(|e| OrchestratorError::load_failure(e.agent_id, e.cause))?;
        info!(agent_id = %agent_id, "Preloaded agent");
        Ok(())
    }

    /// Backoff between in-phase retries; cancellation cuts it short
    async fn pause(
        &self,
        machine: &mut LifecycleMachine,
        cancel: &CancelSignal,
        agent_id: &str,
    ) -> OrchestratorResult<()> {
        let delay = self.backoff.delay_for(machine.context().attempts);
        if !delay.is_zero() {
            debug!(agent_id = %agent_id, delay_ms = delay.as_millis() as u64, "Backing off before retry");
            let slept = cancel.guard(async {
                tokio::time::sleep(delay).await;
                Ok(())
            });
            if slept.await.is_err() {
                return Err(self.cancelled(machine, Some(agent_id)));
            }
        }
        Ok(())
    }

    /// Abort if either token was tripped
    fn checkpoint(
        &self,
        machine: &mut LifecycleMachine,
        cancel: &CancelSignal,
        agent_id: Option<&str>,
    ) -> OrchestratorResult<()> {
        if cancel.is_cancelled() {
            return Err(self.cancelled(machine, agent_id));
        }
        Ok(())
    }

    fn cancelled(&self, machine: &mut LifecycleMachine, agent_id: Option<&str>) -> OrchestratorError {
        let phase = machine.state().phase();
        self.advance(machine, LifecycleEvent::Cancel);
        info!(phase = %phase, "Request cancelled");
        OrchestratorError::Cancelled.in_phase(phase, agent_id)
    }

    fn advance(&self, machine: &mut LifecycleMachine, event: LifecycleEvent) {
        if let Err(e) = machine.send(event) {
            warn!(error = %e, "Ignoring lifecycle event");
        }
    }
}
