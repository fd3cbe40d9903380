//! Circuit breaker and retry behaviour through the public resilience API.

use anyhow::Result;
use orchestrator::reliability::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, RetryConfig,
};
use orchestrator::{HandlerError, ResilienceConfig, ResilienceError, ResilienceLayer};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn layer(max_attempts: u32, failure_threshold: u32) -> ResilienceLayer {
    ResilienceLayer::new(ResilienceConfig {
        retry: RetryConfig {
            max_attempts,
            max_duration: Duration::from_secs(5),
            backoff: BackoffStrategy::Fixed {
                delay: Duration::from_millis(5),
            },
        },
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold,
            reset_timeout: Duration::from_millis(100),
        },
        call_timeout: Duration::from_secs(1),
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_half_open_admits_exactly_one_probe() -> Result<()> {
    let breaker = Arc::new(CircuitBreaker::new(
        "peer",
        CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(50),
        },
    ));
    breaker.try_acquire()?.failure();
    assert_eq!(breaker.state(), CircuitBreakerState::Open);
    assert!(breaker.try_acquire().is_err());

    tokio::time::sleep(Duration::from_millis(60)).await;

    let start = Arc::new(tokio::sync::Barrier::new(16));
    let mut contenders = Vec::new();
    for _ in 0..16 {
        let breaker = breaker.clone();
        let start = start.clone();
        contenders.push(tokio::spawn(async move {
            start.wait().await;
            breaker.try_acquire().ok()
        }));
    }
    let mut permits = Vec::new();
    for contender in contenders {
        if let Some(permit) = contender.await? {
            permits.push(permit);
        }
    }

    assert_eq!(permits.len(), 1);
    let probe = permits.remove(0);
    assert!(probe.is_probe());
    assert_eq!(breaker.state(), CircuitBreakerState::HalfOpen);

    probe.success();
    assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    assert!(breaker.try_acquire().is_ok());
    Ok(())
}

#[tokio::test]
async fn test_failed_probe_reopens() -> Result<()> {
    let breaker = Arc::new(CircuitBreaker::new(
        "peer",
        CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(20),
        },
    ));
    breaker.try_acquire()?.failure();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let probe = breaker.try_acquire()?;
    assert!(probe.is_probe());
    probe.failure();
    assert_eq!(breaker.state(), CircuitBreakerState::Open);
    assert!(breaker.try_acquire().is_err());
    Ok(())
}

#[tokio::test]
async fn test_transient_errors_are_retried() -> Result<()> {
    let layer = layer(3, 10);
    let calls = AtomicU32::new(0);

    let value = layer
        .call("flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(HandlerError::Transient("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await?;

    assert_eq!(value, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn test_permanent_error_returned_on_first_attempt() {
    let layer = layer(5, 10);
    let calls = AtomicU32::new(0);

    let err = layer
        .call("strict", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HandlerError::Permanent("bad request".into())) }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::Permanent { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // a permanent answer is a healthy response
    assert_eq!(layer.breaker("strict").state(), CircuitBreakerState::Closed);
}

#[tokio::test]
async fn test_open_breaker_fails_fast() {
    let layer = layer(5, 2);
    let calls = AtomicU32::new(0);
    let failing = || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(HandlerError::Transient("down".into())) }
    };

    let first = layer.call("down", failing).await.unwrap_err();
    assert!(matches!(first, ResilienceError::Exhausted { attempts: 2, .. }));
    assert_eq!(layer.breaker("down").state(), CircuitBreakerState::Open);

    let second = layer.call("down", failing).await.unwrap_err();
    assert!(matches!(second, ResilienceError::CircuitOpen(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
