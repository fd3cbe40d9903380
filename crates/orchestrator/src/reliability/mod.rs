//! Resilience Layer
//!
//! Wraps calls to external dependencies (broker, checkpoint store, peers) with
//! a per-destination circuit breaker, a per-attempt timeout, and a retry loop
//! with exponential backoff and jitter.

pub mod circuit_breaker;
pub mod retry_policy;

pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitBreakerState,
    CircuitOpenError,
};
pub use retry_policy::{BackoffStrategy, RetryConfig, RetryError, RetryPolicy};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Classify, ErrorClass};

/// Configuration for the resilience layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Upper bound of a single attempt
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// What went wrong on the final attempt
#[derive(Debug)]
pub enum AttemptFailure<E> {
    Error(E),
    TimedOut(Duration),
}

impl<E: fmt::Display> fmt::Display for AttemptFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Error(e) => write!(f, "{e}"),
            AttemptFailure::TimedOut(d) => write!(f, "attempt timed out after {d:?}"),
        }
    }
}

/// Failure of a call made through [`ResilienceLayer::call`]
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// The breaker rejected the call before any attempt was made
    CircuitOpen(CircuitOpenError),

    /// A non-transient error, returned on first occurrence
    Permanent { destination: String, error: E },

    /// Transient failures used up the retry budget or tripped the breaker
    Exhausted {
        destination: String,
        attempts: u32,
        last: AttemptFailure<E>,
    },
}

impl<E> ResilienceError<E> {
    /// The underlying error, if the last failure carried one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Permanent { error, .. } => Some(error),
            ResilienceError::Exhausted {
                last: AttemptFailure::Error(e),
                ..
            } => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceError::CircuitOpen(e) => write!(f, "{e}"),
            ResilienceError::Permanent { destination, error } => {
                write!(f, "call to '{destination}' failed permanently: {error}")
            }
            ResilienceError::Exhausted {
                destination,
                attempts,
                last,
            } => write!(f, "call to '{destination}' failed after {attempts} attempts: {last}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ResilienceError<E> {}

impl<E: Classify> Classify for ResilienceError<E> {
    fn class(&self) -> ErrorClass {
        match self {
            ResilienceError::CircuitOpen(_) | ResilienceError::Exhausted { .. } => {
                ErrorClass::Transient
            }
            ResilienceError::Permanent { error, .. } => error.class(),
        }
    }
}

/// Shared resilience layer. One breaker per destination name.
#[derive(Debug)]
pub struct ResilienceLayer {
    config: ResilienceConfig,
    retry: RetryPolicy,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for ResilienceLayer {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl ResilienceLayer {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Breaker for `destination`, created on first use.
    pub fn breaker(&self, destination: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(destination) {
            return existing.clone();
        }
        self.breakers
            .entry(destination.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    destination,
                    self.config.circuit_breaker.clone(),
                ))
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snaps: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snaps.sort_by(|a, b| a.destination.cmp(&b.destination));
        snaps
    }

    /// Call `operation` against `destination` with breaker, timeout and retry.
    ///
    /// An open breaker fails the call without attempting it. Transient errors
    /// and timeouts count against the breaker and are retried; permanent
    /// errors are returned at once and count as a healthy response.
    pub async fn call<F, Fut, T, E>(
        &self,
        destination: &str,
        mut operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let breaker = self.breaker(destination);
        let started = Instant::now();
        let mut attempts = 0;
        let mut last_failure: Option<AttemptFailure<E>> = None;

        loop {
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    return Err(match last_failure.take() {
                        None => ResilienceError::CircuitOpen(open),
                        Some(last) => ResilienceError::Exhausted {
                            destination: destination.to_string(),
                            attempts,
                            last,
                        },
                    })
                }
            };
            attempts += 1;

            let failure = match tokio::time::timeout(self.config.call_timeout, operation()).await {
                Ok(Ok(value)) => {
                    permit.success();
                    return Ok(value);
                }
                Ok(Err(error)) if !error.is_transient() => {
                    permit.success();
                    return Err(ResilienceError::Permanent {
                        destination: destination.to_string(),
                        error,
                    });
                }
                Ok(Err(error)) => {
                    permit.failure();
                    AttemptFailure::Error(error)
                }
                Err(_) => {
                    permit.failure();
                    AttemptFailure::TimedOut(self.config.call_timeout)
                }
            };

            match self.retry.next_delay(attempts, started) {
                Some(delay) if breaker.state() != CircuitBreakerState::Open => {
                    debug!(
                        destination,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Call failed, retrying after delay"
                    );
                    last_failure = Some(failure);
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    warn!(destination, attempts, error = %failure, "Call failed, giving up");
                    return Err(ResilienceError::Exhausted {
                        destination: destination.to_string(),
                        attempts,
                        last: failure,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Unavailable;

    impl fmt::Display for Unavailable {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("unavailable")
        }
    }

    impl Classify for Unavailable {
        fn class(&self) -> ErrorClass {
            ErrorClass::Transient
        }
    }

    fn layer(max_attempts: u32, threshold: u32) -> ResilienceLayer {
        ResilienceLayer::new(ResilienceConfig {
            retry: RetryConfig {
                max_attempts,
                max_duration: Duration::from_secs(5),
                backoff: BackoffStrategy::Fixed {
                    delay: Duration::from_millis(1),
                },
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(60),
            },
            call_timeout: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn test_breakers_are_per_destination() {
        let layer = layer(1, 1);
        let _ = layer
            .call("broker", || async { Err::<(), _>(Unavailable) })
            .await;

        assert_eq!(layer.breaker("broker").state(), CircuitBreakerState::Open);
        assert_eq!(
            layer.breaker("checkpoint").state(),
            CircuitBreakerState::Closed
        );
        assert_eq!(layer.snapshots().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_stops_when_breaker_opens() {
        let layer = layer(10, 2);
        let attempts = AtomicU32::new(0);

        let result = layer
            .call("peer", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Unavailable) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted { attempts: 2, .. })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_transient() {
        let layer = layer(2, 5);
        let result = layer
            .call("slow", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, Unavailable>(())
            })
            .await;

        match result {
            Err(ResilienceError::Exhausted {
                attempts,
                last: AttemptFailure::TimedOut(_),
                ..
            }) => assert_eq!(attempts, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(layer.breaker("slow").snapshot().consecutive_failures, 2);
    }
}
