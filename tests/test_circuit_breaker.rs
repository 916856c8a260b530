//! Circuit breaker state machine under virtual time
//!
//! Time is paused so reset timeouts and call timeouts elapse deterministically.

use inference_orchestrator::config::{BreakerSettings, BreakersSection};
use inference_orchestrator::error::{OrchestratorError, OrchestratorResult};
use inference_orchestrator::resilience::{BreakerRegistry, CircuitBreaker, CircuitState, Operation};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn settings() -> BreakerSettings {
    BreakerSettings {
        failure_threshold: 3,
        reset_timeout_ms: 10_000,
        call_timeout_ms: 5_000,
    }
}

async fn fail(breaker: &CircuitBreaker) -> OrchestratorResult<()> {
    breaker
        .execute(|| async { Err(OrchestratorError::load_failure("vision-agent", "out of memory")) })
        .await
}

async fn open(breaker: &CircuitBreaker) {
    for _ in 0..3 {
        fail(breaker).await.unwrap_err();
    }
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_rejects_without_calling() {
    let breaker = CircuitBreaker::new("vision-agent:load", settings());
    open(&breaker).await;

    let calls = AtomicUsize::new(0);
    let err = breaker
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(breaker.snapshot().rejections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_exactly_one_trial() {
    let breaker = Arc::new(CircuitBreaker::new("vision-agent:load", settings()));
    open(&breaker).await;
    tokio::time::advance(Duration::from_millis(10_001)).await;

    let (release_tx, release_rx) = oneshot::channel::<()>();
    let trial = {
        let breaker = breaker.clone();
        tokio::spawn(async move {
            breaker
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        })
    };
    tokio::task::yield_now().await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // A second caller while the trial is in flight is rejected
    let rejected = breaker.execute(|| async { Ok(()) }).await.unwrap_err();
    assert!(rejected.is_circuit_open());

    release_tx.send(()).unwrap();
    trial.await.unwrap().unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_and_restarts_timer() {
    let breaker = CircuitBreaker::new("vision-agent:load", settings());
    open(&breaker).await;
    tokio::time::advance(Duration::from_millis(10_001)).await;

    fail(&breaker).await.unwrap_err();
    assert_eq!(breaker.state(), CircuitState::Open);

    // The timer restarted with the failed trial
    tokio::time::advance(Duration::from_millis(5_000)).await;
    assert!(breaker.execute(|| async { Ok(()) }).await.unwrap_err().is_circuit_open());

    tokio::time::advance(Duration::from_millis(5_001)).await;
    breaker.execute(|| async { Ok(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_hung_call_times_out_and_counts_as_failure() {
    let breaker = CircuitBreaker::new("code-agent:inference", settings());

    let err = breaker
        .execute(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Timeout { timeout_ms: 5_000 }));
    assert_eq!(breaker.failure_count(), 1);
    assert_eq!(breaker.snapshot().timeouts, 1);
}

#[tokio::test]
async fn test_registry_isolates_agents_and_operations() {
    let registry = BreakerRegistry::new(BreakersSection::default());

    let vision_load = registry.get_or_create("vision-agent", Operation::Load);
    for _ in 0..3 {
        fail(&vision_load).await.unwrap_err();
    }

    assert_eq!(vision_load.state(), CircuitState::Open);
    assert_eq!(
        registry.get_or_create("vision-agent", Operation::Inference).state(),
        CircuitState::Closed
    );
    assert_eq!(
        registry.get_or_create("code-agent", Operation::Load).state(),
        CircuitState::Closed
    );
    assert!(Arc::ptr_eq(
        &vision_load,
        &registry.get_or_create("vision-agent", Operation::Load)
    ));

    registry.reset_all();
    assert_eq!(vision_load.state(), CircuitState::Closed);
    assert_eq!(registry.snapshot_all().len(), 3);
}
