//! Circuit Breaker Implementation
//!
//! One breaker guards one destination (broker, checkpoint store, peer agent)
//! so a failing dependency is not hammered while it recovers.
//!
//! - `Closed`: calls flow, consecutive failures are counted
//! - `Open`: calls fail immediately until `reset_timeout` has elapsed
//! - `HalfOpen`: exactly one probe is admitted, its outcome picks the next state

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{Classify, ErrorClass};

/// Returned instead of attempting a call while the breaker is open.
#[derive(Debug, Clone, Error)]
#[error("circuit open for '{destination}', retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub destination: String,
    pub retry_after: Duration,
}

impl Classify for CircuitOpenError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    /// Requests flow through normally
    #[default]
    Closed,

    /// Requests are blocked
    Open,

    /// One probe request decides whether the destination recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time spent open before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub destination: String,
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub state_transitions: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for a single destination
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(destination: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            destination: destination.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
            total_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask to place a call. The permit must be resolved with
    /// [`CallPermit::success`] or [`CallPermit::failure`]; dropping it
    /// unresolved counts as a failure.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitOpenError> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitBreakerState::Closed => Ok(CallPermit::new(self.clone(), false)),
            CircuitBreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitBreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(CallPermit::new(self.clone(), true))
                } else {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    Err(self.open_error(self.config.reset_timeout - elapsed))
                }
            }
            CircuitBreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    Err(self.open_error(Duration::ZERO))
                } else {
                    inner.probe_in_flight = true;
                    Ok(CallPermit::new(self.clone(), true))
                }
            }
        }
    }

    /// Current state as last recorded. An open breaker whose timeout elapsed
    /// stays `Open` here until the next call turns it half-open.
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if probe {
            inner.probe_in_flight = false;
        }
        if inner.state == CircuitBreakerState::HalfOpen && probe {
            self.transition(&mut inner, CircuitBreakerState::Closed);
        }
        debug!(destination = %self.destination, state = %inner.state, "Recorded successful call");
    }

    fn record_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());
        if probe {
            inner.probe_in_flight = false;
        }

        match inner.state {
            CircuitBreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitBreakerState::Open);
                }
            }
            CircuitBreakerState::HalfOpen if probe => {
                self.transition(&mut inner, CircuitBreakerState::Open);
            }
            // late results from calls admitted before the circuit opened
            CircuitBreakerState::HalfOpen | CircuitBreakerState::Open => {}
        }
        debug!(
            destination = %self.destination,
            state = %inner.state,
            consecutive_failures = inner.consecutive_failures,
            "Recorded failed call"
        );
    }

    fn transition(&self, inner: &mut BreakerInner, next: CircuitBreakerState) {
        if inner.state == next {
            return;
        }
        match next {
            CircuitBreakerState::Open => {
                warn!(
                    destination = %self.destination,
                    consecutive_failures = inner.consecutive_failures,
                    "Circuit breaker opening - blocking calls"
                );
                inner.opened_at = Some(Instant::now());
            }
            CircuitBreakerState::HalfOpen => {
                info!(destination = %self.destination, "Circuit breaker half-open - probing destination");
            }
            CircuitBreakerState::Closed => {
                info!(destination = %self.destination, "Circuit breaker closing - destination recovered");
                inner.opened_at = None;
            }
        }
        inner.state = next;
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            destination: self.destination.clone(),
            retry_after,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            destination: self.destination.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            failure_threshold: self.config.failure_threshold,
            reset_timeout: self.config.reset_timeout,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }
}

/// Admission to place one call through a breaker.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    resolved: AtomicBool,
}

impl CallPermit {
    fn new(breaker: Arc<CircuitBreaker>, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            resolved: AtomicBool::new(false),
        }
    }

    /// True when this call is the single half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(self) {
        self.resolved.store(true, Ordering::Relaxed);
        self.breaker.record_success(self.probe);
    }

    pub fn failure(self) {
        self.resolved.store(true, Ordering::Relaxed);
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.resolved.load(Ordering::Relaxed) {
            self.breaker.record_failure(self.probe);
        }
    }
}
