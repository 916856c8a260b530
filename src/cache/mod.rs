//! Resource cache for loaded agents
//!
//! Keeps at most one resident instance per agent id, bounded by a memory budget
//! and a maximum count. Eviction is least-recently-used. Concurrent misses for the
//! same id share one in-flight load ticket, so the agent factory runs at most once
//! per load attempt and every waiter observes the same instance or the same error.
//!
//! The internal lock is never held across an `.await`: loads and unloads run
//! outside it, and admission (evict, then insert) happens in one critical section
//! so the budget invariant holds at every point another task can observe.
//!
//! A load is driven by whoever awaits its ticket. When the last waiter gives up
//! (timeout or cancellation) the ticket is dropped, the id is free for a fresh
//! factory call and any instance the abandoned load created is unloaded.
//! An evicted agent that a running request still holds is unloaded once that
//! request lets go of it.

use crate::agent::{Agent, AgentFactory};
use crate::config::CacheSection;
use crate::progress::{LoadPhase, ProgressReporter, ProgressSender};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Failure of a single load attempt, shared by all callers waiting on it
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Failed to load agent {agent_id} during {phase}: {cause}")]
pub struct LoadError {
    pub agent_id: String,
    pub phase: &'static str,
    pub cause: String,
}

impl LoadError {
    fn new(agent_id: &str, cause: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            phase: "agent_loading",
            cause: cause.into(),
        }
    }
}

type LoadOutcome = Result<Arc<dyn Agent>, LoadError>;
type LoadTicket = Shared<BoxFuture<'static, LoadOutcome>>;

/// Poll interval while an evicted agent is still in use
const RELEASE_POLL: Duration = Duration::from_millis(10);

struct InFlight {
    ticket_id: u64,
    ticket: LoadTicket,
    waiters: usize,
    /// Instance built by the factory and not yet admitted
    pending: Option<Arc<dyn Agent>>,
}

struct CacheEntry {
    instance: Arc<dyn Agent>,
    loaded_at: Instant,
    last_accessed_at: Instant,
    /// Monotonic access stamp; orders entries for LRU independent of clock resolution
    access_seq: u64,
    access_count: u64,
    memory_cost_mb: u64,
}

/// Point-in-time view of one resident agent
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub agent_id: String,
    pub memory_cost_mb: u64,
    pub access_count: u64,
    pub resident_for: Duration,
    pub idle_for: Duration,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CacheStats {
    pub resident: usize,
    pub loading: usize,
    pub memory_used_mb: u64,
    pub memory_budget_mb: u64,
    pub max_agents: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub load_failures: u64,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    memory_budget_mb: u64,
    max_agents: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    loading: HashMap<String, InFlight>,
    closed: bool,
    memory_used_mb: u64,
    access_clock: u64,
    next_ticket: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    load_failures: u64,
}

impl Inner {
    fn next_access(&mut self) -> u64 {
        self.access_clock += 1;
        self.access_clock
    }

    /// Drop the loading ticket only if it is still the one this load created
    fn settle_ticket(&mut self, agent_id: &str, ticket_id: u64) {
        if self
            .loading
            .get(agent_id)
            .is_some_and(|flight| flight.ticket_id == ticket_id)
        {
            self.loading.remove(agent_id);
        }
    }

    fn in_flight(&mut self, agent_id: &str, ticket_id: u64) -> Option<&mut InFlight> {
        self.loading
            .get_mut(agent_id)
            .filter(|flight| flight.ticket_id == ticket_id)
    }

    /// Evict least-recently-used entries until `incoming_mb` fits
    fn evict_for(&mut self, incoming_mb: u64, limits: Limits) -> Vec<(String, Arc<dyn Agent>)> {
        let mut victims = Vec::new();

        while self.memory_used_mb + incoming_mb > limits.memory_budget_mb
            || self.entries.len() >= limits.max_agents
        {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.access_seq)
                .map(|(id, _)| id.clone())
            else {
                break;
            };

            if let Some(entry) = self.entries.remove(&oldest) {
                self.memory_used_mb -= entry.memory_cost_mb;
                self.evictions += 1;
                victims.push((oldest, entry.instance));
            }
        }

        victims
    }
}

/// Memory- and count-bounded store of loaded agents
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<Mutex<Inner>>,
    limits: Limits,
    progress: ProgressReporter,
}

impl ResourceCache {
    pub fn new(config: &CacheSection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            limits: Limits {
                memory_budget_mb: config.memory_budget_mb,
                max_agents: config.max_agents,
            },
            progress: ProgressReporter::noop(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Return the resident instance for `agent_id`, loading it through `factory` on a miss.
    ///
    /// Concurrent callers for the same id share one load. On success the new entry is
    /// admitted after evicting as many LRU entries as needed; on failure nothing is
    /// admitted and the next call starts a fresh load.
    pub async fn get_or_load(&self, agent_id: &str, factory: &AgentFactory) -> LoadOutcome {
        let (ticket, ticket_id) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(LoadError::new(agent_id, "resource cache is closed"));
            }
            let seq = inner.next_access();

            if let Some(entry) = inner.entries.get_mut(agent_id) {
                entry.last_accessed_at = Instant::now();
                entry.access_seq = seq;
                entry.access_count += 1;
                let instance = entry.instance.clone();
                inner.hits += 1;
                debug!(agent_id = %agent_id, "Cache hit");
                return Ok(instance);
            }

            inner.misses += 1;

            if let Some(flight) = inner.loading.get_mut(agent_id) {
                debug!(agent_id = %agent_id, "Joining in-flight load");
                flight.waiters += 1;
                (flight.ticket.clone(), flight.ticket_id)
            } else {
                inner.next_ticket += 1;
                let ticket_id = inner.next_ticket;
                let ticket = load_and_admit(
                    self.inner.clone(),
                    self.limits,
                    agent_id.to_string(),
                    factory.clone(),
                    self.progress.for_agent(agent_id),
                    ticket_id,
                )
                .boxed()
                .shared();
                inner.loading.insert(
                    agent_id.to_string(),
                    InFlight {
                        ticket_id,
                        ticket: ticket.clone(),
                        waiters: 1,
                        pending: None,
                    },
                );
                debug!(agent_id = %agent_id, "Starting load");
                (ticket, ticket_id)
            }
        };

        let _waiter = LoadWaiter {
            inner: self.inner.clone(),
            agent_id: agent_id.to_string(),
            ticket_id,
        };
        ticket.await
    }

    /// Remove and unload one entry. Returns whether it was resident.
    pub async fn remove(&self, agent_id: &str) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner.entries.remove(agent_id);
            if let Some(entry) = &entry {
                inner.memory_used_mb -= entry.memory_cost_mb;
            }
            entry
        };

        match entry {
            Some(entry) => {
                unload_logged(agent_id, &entry.instance).await;
                info!(agent_id = %agent_id, "Removed agent from cache");
                true
            }
            None => false,
        }
    }

    /// Unload every resident entry, best effort. Returns how many were removed;
    /// a second call in a row finds nothing and returns 0.
    pub async fn clear(&self) -> usize {
        let drained: Vec<(String, CacheEntry)> = {
            let mut inner = self.inner.lock();
            inner.memory_used_mb = 0;
            inner.entries.drain().collect()
        };

        for (agent_id, entry) in &drained {
            unload_logged(agent_id, &entry.instance).await;
        }

        if !drained.is_empty() {
            info!(unloaded = drained.len(), "Cleared resource cache");
        }
        drained.len()
    }

    /// Clear and refuse further admissions until [`reopen`](Self::reopen).
    /// Loads that finish after this point unload their instance instead of
    /// becoming resident.
    pub async fn close(&self) -> usize {
        self.inner.lock().closed = true;
        self.clear().await
    }

    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.inner.lock().entries.contains_key(agent_id)
    }

    pub fn is_loading(&self, agent_id: &str) -> bool {
        self.inner.lock().loading.contains_key(agent_id)
    }

    /// Whether an agent of this cost could be admitted without evicting anything
    pub fn has_capacity_for(&self, cost_mb: u64) -> bool {
        let inner = self.inner.lock();
        inner.memory_used_mb + cost_mb <= self.limits.memory_budget_mb
            && inner.entries.len() < self.limits.max_agents
    }

    /// Resident ids, least recently used first
    pub fn resident_ids(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ids: Vec<_> = inner
            .entries
            .iter()
            .map(|(id, e)| (e.access_seq, id.clone()))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let inner = self.inner.lock();
        let now = Instant::now();
        let mut snapshots: Vec<_> = inner
            .entries
            .iter()
            .map(|(id, e)| {
                (
                    e.access_seq,
                    EntrySnapshot {
                        agent_id: id.clone(),
                        memory_cost_mb: e.memory_cost_mb,
                        access_count: e.access_count,
                        resident_for: now.duration_since(e.loaded_at),
                        idle_for: now.duration_since(e.last_accessed_at),
                    },
                )
            })
            .collect();
        snapshots.sort_by_key(|(seq, _)| *seq);
        snapshots.into_iter().map(|(_, s)| s).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            resident: inner.entries.len(),
            loading: inner.loading.len(),
            memory_used_mb: inner.memory_used_mb,
            memory_budget_mb: self.limits.memory_budget_mb,
            max_agents: self.limits.max_agents,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            load_failures: inner.load_failures,
        }
    }
}

async fn load_and_admit(
    inner: Arc<Mutex<Inner>>,
    limits: Limits,
    agent_id: String,
    factory: AgentFactory,
    progress: ProgressSender,
    ticket_id: u64,
) -> LoadOutcome {
    progress.report(LoadPhase::Started, 0.0, "loading");
    let instance: Arc<dyn Agent> = Arc::from(factory());
    let cost = instance.descriptor().resource_cost_mb;
    {
        let mut guard = inner.lock();
        if let Some(flight) = guard.in_flight(&agent_id, ticket_id) {
            flight.pending = Some(instance.clone());
        }
    }

    if let Err(e) = instance.load(&progress).await {
        {
            let mut guard = inner.lock();
            guard.settle_ticket(&agent_id, ticket_id);
            guard.load_failures += 1;
        }
        progress.report(LoadPhase::Failed, 0.0, e.to_string());
        warn!(agent_id = %agent_id, error = %e, "Agent load failed");
        return Err(LoadError::new(&agent_id, e.to_string()));
    }

    let admitted = {
        let mut guard = inner.lock();
        guard.settle_ticket(&agent_id, ticket_id);

        if guard.closed {
            Err(LoadError::new(&agent_id, "resource cache closed during load"))
        } else if cost > limits.memory_budget_mb || limits.max_agents == 0 {
            guard.load_failures += 1;
            Err(LoadError::new(
                &agent_id,
                format!(
                    "requires {cost}MB, exceeding the {}MB budget",
                    limits.memory_budget_mb
                ),
            ))
        } else {
            let victims = guard.evict_for(cost, limits);
            let now = Instant::now();
            let seq = guard.next_access();
            guard.entries.insert(
                agent_id.clone(),
                CacheEntry {
                    instance: instance.clone(),
                    loaded_at: now,
                    last_accessed_at: now,
                    access_seq: seq,
                    access_count: 1,
                    memory_cost_mb: cost,
                },
            );
            guard.memory_used_mb += cost;
            Ok(victims)
        }
    };

    match admitted {
        Ok(victims) => {
            for (victim_id, victim) in &victims {
                info!(agent_id = %victim_id, incoming = %agent_id, "Evicting least recently used agent");
                release(victim_id.clone(), victim.clone()).await;
            }
            progress.report(LoadPhase::Ready, 1.0, "ready");
            info!(agent_id = %agent_id, cost_mb = cost, "Agent loaded");
            Ok(instance)
        }
        Err(e) => {
            warn!(agent_id = %agent_id, error = %e, "Loaded agent not admitted");
            unload_logged(&agent_id, &instance).await;
            progress.report(LoadPhase::Failed, 0.0, e.cause.clone());
            Err(e)
        }
    }
}

/// Unload an evicted agent once no request is still using it
async fn release(agent_id: String, instance: Arc<dyn Agent>) {
    // The victims list and this argument account for two references.
    if Arc::strong_count(&instance) <= 2 {
        unload_logged(&agent_id, &instance).await;
        return;
    }

    debug!(agent_id = %agent_id, "Deferring unload of evicted agent still in use");
    tokio::spawn(async move {
        while Arc::strong_count(&instance) > 1 {
            tokio::time::sleep(RELEASE_POLL).await;
        }
        unload_logged(&agent_id, &instance).await;
    });
}

/// Held by each caller awaiting a load ticket
struct LoadWaiter {
    inner: Arc<Mutex<Inner>>,
    agent_id: String,
    ticket_id: u64,
}

impl Drop for LoadWaiter {
    fn drop(&mut self) {
        // A settled ticket is already gone from the map; only an abandoned one remains.
        let abandoned = {
            let mut inner = self.inner.lock();
            let Some(flight) = inner.in_flight(&self.agent_id, self.ticket_id) else {
                return;
            };
            flight.waiters = flight.waiters.saturating_sub(1);
            if flight.waiters > 0 {
                return;
            }
            inner.load_failures += 1;
            inner.loading.remove(&self.agent_id)
        };

        warn!(agent_id = %self.agent_id, "Load abandoned by every waiter");
        let Some(instance) = abandoned.and_then(|flight| flight.pending) else {
            return;
        };
        let agent_id = self.agent_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { unload_logged(&agent_id, &instance).await });
        }
    }
}

async fn unload_logged(agent_id: &str, instance: &Arc<dyn Agent>) {
    if let Err(e) = instance.unload().await {
        warn!(agent_id = %agent_id, error = %e, "Agent unload failed");
    }
}
