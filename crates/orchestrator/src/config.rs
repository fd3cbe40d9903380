//! Configuration for the runtime, messaging, checkpoints and orchestration.
//!
//! Values come from defaults, then an optional TOML file (`AGENT_CONFIG`),
//! then `AGENT_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use common::env;

use crate::error::{Classify, ErrorClass};
use crate::orchestration::FailurePolicy;
use crate::reliability::ResilienceConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Classify for ConfigError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Permanent
    }
}

/// Admission, drain and checkpoint timing of one agent runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tasks executing at once
    pub concurrency_limit: usize,
    /// Accepted tasks waiting for a slot
    pub queue_capacity: usize,
    /// Queued longer than this fails with `QueueTimeout`
    #[serde(with = "humantime_serde")]
    pub queue_wait_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_grace_period: Duration,
    /// Wait for in-flight tasks to honor a forced cancellation
    #[serde(with = "humantime_serde")]
    pub cancellation_grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub checkpoint_interval: Duration,
    /// Consecutive transient handler failures before the runtime reports `Degraded`
    pub degrade_after_failures: u32,
    /// Escalate to `Stopped` after this many failed checkpoints in a row. Off when unset.
    pub max_consecutive_checkpoint_failures: Option<u32>,
    /// Completed results kept for duplicate deliveries
    pub result_cache_size: usize,
    /// Redelivery delay for messages rejected while full or draining
    #[serde(with = "humantime_serde")]
    pub nak_delay: Duration,
    pub config_version: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            queue_capacity: 64,
            queue_wait_timeout: Duration::from_secs(30),
            drain_grace_period: Duration::from_secs(30),
            cancellation_grace_period: Duration::from_secs(5),
            checkpoint_interval: Duration::from_secs(60),
            degrade_after_failures: 3,
            max_consecutive_checkpoint_failures: None,
            result_cache_size: 1024,
            nak_delay: Duration::from_secs(1),
            config_version: "1".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.concurrency_limit == 0 {
            return invalid("runtime.concurrency_limit must be at least 1");
        }
        if self.checkpoint_interval.is_zero() {
            return invalid("runtime.checkpoint_interval must be non-zero");
        }
        if self.queue_wait_timeout.is_zero() {
            return invalid("runtime.queue_wait_timeout must be non-zero");
        }
        if self.result_cache_size == 0 {
            return invalid("runtime.result_cache_size must be at least 1");
        }
        Ok(())
    }
}

/// Broker connection and delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// `sqlite://<path>` for the durable broker, `memory://` or unset for in-process
    pub broker_url: Option<String>,
    /// Unacknowledged deliveries become eligible again after this
    #[serde(with = "humantime_serde")]
    pub ack_wait: Duration,
    /// Deliveries of one message before it is dropped
    pub max_deliver: u32,
    /// Longest single fetch wait of a subscription
    #[serde(with = "humantime_serde")]
    pub fetch_wait: Duration,
    /// Poll interval of brokers without push notification
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Messages on a subject without consumers are dropped after this
    #[serde(with = "humantime_serde")]
    pub unconsumed_retention: Duration,
    /// Durable consumers that neither fetch nor renew a lease for this long
    /// are removed, releasing the messages they pin
    #[serde(with = "humantime_serde")]
    pub consumer_inactive_threshold: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            fetch_wait: Duration::from_millis(500),
            poll_interval: Duration::from_millis(25),
            unconsumed_retention: Duration::from_secs(300),
            consumer_inactive_threshold: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// `memory://`, `file://<dir>` or `sqlite://<path>`
    pub store_url: String,
    /// Superseded snapshots kept next to the current one
    pub retain_generations: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            store_url: "memory://".to_string(),
            retain_generations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(with = "humantime_serde")]
    pub default_plan_deadline: Duration,
    pub default_failure_policy: FailurePolicy,
    /// Reject plans naming a task type no registered agent serves
    pub require_registered_task_types: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_plan_deadline: Duration::from_secs(300),
            default_failure_policy: FailurePolicy::Abort,
            require_registered_task_types: false,
        }
    }
}

/// Full configuration of an agent process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub runtime: RuntimeConfig,
    pub messaging: MessagingConfig,
    pub checkpoint: CheckpointConfig,
    pub reliability: ResilienceConfig,
    pub orchestrator: OrchestratorConfig,
}

impl AgentConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Defaults, then `AGENT_CONFIG` file if set, then env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = match env::var_string("AGENT_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env::var_parse("AGENT_CONCURRENCY") {
            self.runtime.concurrency_limit = v;
        }
        if let Some(v) = env::var_parse("AGENT_QUEUE_CAPACITY") {
            self.runtime.queue_capacity = v;
        }
        if let Some(v) = env::var_duration_ms("AGENT_QUEUE_WAIT_MS") {
            self.runtime.queue_wait_timeout = v;
        }
        if let Some(v) = env::var_duration_ms("AGENT_DRAIN_GRACE_MS") {
            self.runtime.drain_grace_period = v;
        }
        if let Some(v) = env::var_duration_ms("AGENT_CHECKPOINT_INTERVAL_MS") {
            self.runtime.checkpoint_interval = v;
        }
        if let Some(v) = env::var_string("AGENT_CONFIG_VERSION") {
            self.runtime.config_version = v;
        }
        if let Some(v) = env::var_string("AGENT_BROKER_URL") {
            self.messaging.broker_url = Some(v);
        }
        if let Some(v) = env::var_string("AGENT_CHECKPOINT_URL") {
            self.checkpoint.store_url = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        self.runtime.validate()?;
        if self.messaging.ack_wait.is_zero() || self.messaging.fetch_wait.is_zero() {
            return invalid("messaging.ack_wait and messaging.fetch_wait must be non-zero");
        }
        if self.messaging.unconsumed_retention.is_zero() || self.messaging.consumer_inactive_threshold.is_zero() {
            return invalid("messaging.unconsumed_retention and messaging.consumer_inactive_threshold must be non-zero");
        }
        if self.messaging.max_deliver == 0 {
            return invalid("messaging.max_deliver must be at least 1");
        }
        if self.reliability.retry.max_attempts == 0 {
            return invalid("reliability.retry.max_attempts must be at least 1");
        }
        if self.reliability.circuit_breaker.failure_threshold == 0 {
            return invalid("reliability.circuit_breaker.failure_threshold must be at least 1");
        }
        if self.reliability.call_timeout.is_zero() {
            return invalid("reliability.call_timeout must be non-zero");
        }
        Ok(())
    }
}
