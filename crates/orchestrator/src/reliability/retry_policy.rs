//! Retry Policy Implementation
//!
//! Configurable retry logic with exponential backoff and jitter. Only errors
//! classified as transient are retried.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Classify, ErrorClass};

/// Why a retried operation gave up
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed transiently
    Exhausted { attempts: u32, last: E },

    /// A non-transient error stopped the loop at once
    Permanent { attempts: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Permanent { error, .. } => error,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Permanent { attempts, .. } => {
                *attempts
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            RetryError::Permanent { error, .. } => write!(f, "permanent failure: {error}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl<E: Classify> Classify for RetryError<E> {
    fn class(&self) -> ErrorClass {
        match self {
            RetryError::Exhausted { last, .. } => last.class(),
            RetryError::Permanent { error, .. } => error.class(),
        }
    }
}

/// Backoff strategies for retry delays
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },

    /// Linear backoff: initial_delay + increment * attempt
    Linear {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },

    /// Exponential backoff: initial_delay * base^attempt, capped
    Exponential {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        base: f64,
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
        jitter: bool,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay: Duration::from_millis(100),
            base: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl BackoffStrategy {
    /// Delay before retry number `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,

            Self::Linear {
                initial_delay,
                increment,
            } => *initial_delay + *increment * attempt,

            Self::Exponential {
                initial_delay,
                base,
                max_delay,
                jitter,
            } => {
                let base_delay = initial_delay.as_millis() as f64 * base.powf(attempt as f64);
                let delay = Duration::from_millis(base_delay.min(max_delay.as_millis() as f64) as u64);

                if *jitter {
                    Self::add_jitter(delay).min(*max_delay)
                } else {
                    delay
                }
            }
        }
    }

    /// ±25% random variation
    fn add_jitter(delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_factor = rng.gen_range(0.75..=1.25);
        Duration::from_millis((delay.as_millis() as f64 * jitter_factor) as u64)
    }
}

/// Configuration for retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// No retry is started once this much time has been spent
    #[serde(with = "humantime_serde")]
    pub max_duration: Duration,

    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_duration: Duration::from_secs(60),
            backoff: BackoffStrategy::default(),
        }
    }
}

/// Stateless retry loop. Cheap to clone and share between callers.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the next attempt, or `None` once attempts or time ran out.
    /// `attempts` counts the attempts made so far.
    pub fn next_delay(&self, attempts: u32, started: Instant) -> Option<Duration> {
        if attempts >= self.config.max_attempts {
            return None;
        }
        let delay = self.config.backoff.calculate_delay(attempts.saturating_sub(1));
        if started.elapsed() + delay > self.config.max_duration {
            return None;
        }
        Some(delay)
    }

    /// Run `operation` until it succeeds, fails permanently, or the budget is spent.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let started = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => {
                    debug!(error = %error, attempts, "Operation failed permanently, not retrying");
                    return Err(RetryError::Permanent { attempts, error });
                }
                Err(error) => match self.next_delay(attempts, started) {
                    Some(delay) => {
                        debug!(
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Operation failed, retrying after delay"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(attempts, error = %error, "Retry budget exhausted");
                        return Err(RetryError::Exhausted {
                            attempts,
                            last: error,
                        });
                    }
                },
            }
        }
    }
}
