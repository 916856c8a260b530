//! Resource cache behavior under realistic agent mixes
//!
//! Focus on the observable guarantees: the memory budget and agent count are
//! never exceeded, eviction follows recency of use, and concurrent requests for
//! the same agent share one load.

use inference_orchestrator::cache::ResourceCache;
use inference_orchestrator::config::CacheSection;
use inference_orchestrator::testing::MockAgentSpec;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn cache(memory_budget_mb: u64, max_agents: usize) -> ResourceCache {
    ResourceCache::new(&CacheSection {
        memory_budget_mb,
        max_agents,
    })
}

#[tokio::test]
async fn test_heavy_agents_rotate_through_budget() {
    // Two heavy agents fit, a third forces out the least recently used one
    let cache = cache(8000, 3);
    let chat = MockAgentSpec::new("conversation-agent").with_cost(3500);
    let code = MockAgentSpec::new("code-agent").with_cost(3500);
    let vision = MockAgentSpec::new("vision-agent").with_cost(4000);

    cache.get_or_load("conversation-agent", &chat.factory()).await.unwrap();
    cache.get_or_load("code-agent", &code.factory()).await.unwrap();
    cache.get_or_load("conversation-agent", &chat.factory()).await.unwrap();
    cache.get_or_load("vision-agent", &vision.factory()).await.unwrap();

    assert!(cache.contains("conversation-agent"));
    assert!(!cache.contains("code-agent"));
    assert!(cache.contains("vision-agent"));
    assert_eq!(code.counters().unloads(), 1);

    let stats = cache.stats();
    assert_eq!(stats.memory_used_mb, 7500);
    assert_eq!(stats.evictions, 1);
    assert_eq!(
        cache.resident_ids(),
        vec!["conversation-agent".to_string(), "vision-agent".to_string()]
    );
}

#[tokio::test]
async fn test_concurrent_requests_share_one_instance() {
    let cache = Arc::new(cache(8000, 2));
    let spec = MockAgentSpec::new("code-agent").with_load_delay(Duration::from_millis(30));

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            let factory = spec.factory();
            tokio::spawn(async move { cache.get_or_load("code-agent", &factory).await })
        })
        .collect();

    let mut instances = Vec::new();
    for handle in handles {
        instances.push(handle.await.unwrap().unwrap());
    }

    assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(spec.counters().factory_calls(), 1);
    assert_eq!(spec.counters().loads(), 1);
}

#[tokio::test]
async fn test_clear_unloads_everything_once() {
    let cache = cache(8000, 2);
    let a = MockAgentSpec::new("a");
    let b = MockAgentSpec::new("b");
    cache.get_or_load("a", &a.factory()).await.unwrap();
    cache.get_or_load("b", &b.factory()).await.unwrap();

    assert_eq!(cache.clear().await, 2);
    assert_eq!(cache.clear().await, 0);
    assert_eq!(a.counters().unloads(), 1);
    assert_eq!(b.counters().unloads(), 1);
    assert_eq!(cache.stats().memory_used_mb, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_budget_and_count_never_exceeded(
        budget in 500u64..4000,
        max_agents in 1usize..4,
        costs in prop::collection::vec(100u64..2000, 6),
        requests in prop::collection::vec(0usize..6, 1..30),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let cache = cache(budget, max_agents);
            let specs: Vec<MockAgentSpec> = costs
                .iter()
                .enumerate()
                .map(|(i, cost)| MockAgentSpec::new(&format!("agent-{i}")).with_cost(*cost))
                .collect();

            for index in requests {
                let id = format!("agent-{index}");
                let result = cache.get_or_load(&id, &specs[index].factory()).await;

                let stats = cache.stats();
                prop_assert!(stats.memory_used_mb <= budget);
                prop_assert!(stats.resident <= max_agents);
                let summed: u64 = cache.entries().iter().map(|e| e.memory_cost_mb).sum();
                prop_assert_eq!(summed, stats.memory_used_mb);

                if result.is_ok() {
                    prop_assert!(cache.contains(&id));
                }
            }
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_abandoned_load_frees_the_agent_for_a_fresh_attempt() {
    let cache = cache(8000, 3);
    let code = MockAgentSpec::new("code-agent")
        .with_slow_first_loads(3, Duration::from_secs(3600));

    for _ in 0..3 {
        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            cache.get_or_load("code-agent", &code.factory()),
        )
        .await;
        assert!(attempt.is_err());
        assert!(!cache.is_loading("code-agent"));
    }
    assert_eq!(code.counters().factory_calls(), 3);
    let stats = cache.stats();
    assert_eq!(stats.loading, 0);
    assert_eq!(stats.load_failures, 3);

    cache.get_or_load("code-agent", &code.factory()).await.unwrap();
    assert_eq!(code.counters().factory_calls(), 4);
    assert!(cache.contains("code-agent"));

    // Instances built by abandoned loads are unloaded in the background
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(code.counters().unloads(), 3);
}

#[tokio::test]
async fn test_load_continues_while_any_waiter_remains() {
    let cache = cache(8000, 3);
    let code = MockAgentSpec::new("code-agent").with_load_delay(Duration::from_millis(50));
    let factory = code.factory();

    let (impatient, patient) = tokio::join!(
        tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_load("code-agent", &factory)
        ),
        cache.get_or_load("code-agent", &factory),
    );

    assert!(impatient.is_err());
    patient.unwrap();
    assert_eq!(code.counters().factory_calls(), 1);
    assert_eq!(code.counters().unloads(), 0);
    assert!(cache.contains("code-agent"));
    assert_eq!(cache.stats().loading, 0);
}

#[tokio::test]
async fn test_eviction_waits_for_agent_still_in_use() {
    let cache = cache(8000, 1);
    let chat = MockAgentSpec::new("conversation-agent");
    let code = MockAgentSpec::new("code-agent");

    let in_use = cache
        .get_or_load("conversation-agent", &chat.factory())
        .await
        .unwrap();
    cache.get_or_load("code-agent", &code.factory()).await.unwrap();

    assert!(!cache.contains("conversation-agent"));
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(chat.counters().unloads(), 0);

    drop(in_use);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(chat.counters().unloads(), 1);
}

#[tokio::test]
async fn test_load_finishing_after_close_is_not_admitted() {
    let cache = cache(8000, 3);
    let code = MockAgentSpec::new("code-agent").with_load_delay(Duration::from_millis(50));

    let pending = {
        let cache = cache.clone();
        let factory = code.factory();
        tokio::spawn(async move { cache.get_or_load("code-agent", &factory).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(cache.is_loading("code-agent"));

    cache.close().await;
    assert!(pending.await.unwrap().is_err());
    assert!(!cache.contains("code-agent"));
    assert_eq!(code.counters().unloads(), 1);
    assert!(cache.get_or_load("code-agent", &code.factory()).await.is_err());

    cache.reopen();
    cache.get_or_load("code-agent", &code.factory()).await.unwrap();
    assert!(cache.contains("code-agent"));
}
