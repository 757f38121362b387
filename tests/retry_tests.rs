//! Tests for the retry executor and its health reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentgate::error::AgentError;
use agentgate::health::{CircuitState, HealthRegistry};
use agentgate::retry::RetryPolicy;

#[tokio::test(start_paused = true)]
async fn retries_retryable_errors_until_success() {
    let policy = RetryPolicy {
        max_attempts: 4,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(100),
        multiplier: 2.0,
    };
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_task = attempts.clone();

    let task = tokio::spawn(async move {
        policy
            .execute(|| {
                let attempts = attempts_for_task.clone();
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(AgentError::Timeout(100))
                    } else {
                        Ok::<_, AgentError>("ok")
                    }
                }
            })
            .await
    });

    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_secs(1)).await;
    let result = task.await.unwrap();

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn stops_immediately_for_non_retryable_errors() {
    let policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        multiplier: 2.0,
    };
    let attempts = Arc::new(AtomicUsize::new(0));

    let result = policy
        .execute(|| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(AgentError::Authentication("bad-key".to_string()))
            }
        })
        .await;

    match result {
        Err(AgentError::Authentication(message)) => assert_eq!(message, "bad-key"),
        other => panic!("expected authentication error, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn returns_last_error_unchanged_when_attempts_are_exhausted() {
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
    };
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_task = attempts.clone();

    let task = tokio::spawn(async move {
        policy
            .execute(|| {
                let attempts = attempts_for_task.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(AgentError::RateLimited {
                        retry_after_ms: Some(250),
                    })
                }
            })
            .await
    });

    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_secs(1)).await;
    let result = task.await.unwrap();

    match result {
        Err(AgentError::RateLimited { retry_after_ms }) => assert_eq!(retry_after_ms, Some(250)),
        other => panic!("expected rate limit error, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn tracked_execution_records_every_attempt_outcome() {
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(10),
        multiplier: 1.0,
    };
    let health = Arc::new(HealthRegistry::default());
    let health_for_task = health.clone();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_task = attempts.clone();

    let task = tokio::spawn(async move {
        policy
            .execute_tracked("openai", &health_for_task, || {
                let attempts = attempts_for_task.clone();
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(AgentError::api(503, "unavailable"))
                    } else {
                        Ok::<_, AgentError>(())
                    }
                }
            })
            .await
    });

    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_secs(1)).await;
    task.await.unwrap().unwrap();

    // Two failures then one success; the success reset the counter.
    let snapshot = health.snapshot("openai").expect("snapshot");
    assert_eq!(snapshot.total_failures, 2);
    assert_eq!(snapshot.total_successes, 1);
    assert_eq!(snapshot.consecutive_failures, 0);
    assert_eq!(snapshot.circuit, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn tracked_exhaustion_opens_the_circuit() {
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(10),
        multiplier: 1.0,
    };
    let health = Arc::new(HealthRegistry::default());
    let health_for_task = health.clone();

    let task = tokio::spawn(async move {
        policy
            .execute_tracked("anthropic", &health_for_task, || async {
                Err::<(), _>(AgentError::api(500, "boom"))
            })
            .await
    });

    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(task.await.unwrap().is_err());

    let snapshot = health.snapshot("anthropic").expect("snapshot");
    assert_eq!(snapshot.total_failures, 3);
    assert_eq!(snapshot.circuit, CircuitState::Open);
    assert!(!health.is_available("anthropic"));
}
