//! Messaging Substrate
//!
//! Durable publish/subscribe over named subjects with explicit ack/nak and
//! redelivery after `ack_wait`. Two brokers implement [`MessageBroker`]:
//!
//! - [`SqliteBroker`]: durable log shared through a SQLite file
//! - [`InMemoryBroker`]: process-local fallback, best effort only
//!
//! [`MessagingSubstrate`] picks one from the configured URL and degrades to
//! the in-process broker when the durable one cannot be reached.

pub mod memory;
pub mod sqlite;
pub mod subjects;

pub use memory::InMemoryBroker;
pub use sqlite::SqliteBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MessagingConfig;
use crate::error::{Classify, ErrorClass};
use crate::reliability::{ResilienceError, ResilienceLayer};

/// Resilience destination name of the durable broker
pub const BROKER_DESTINATION: &str = "broker";

#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker storage error: {0}")]
    Storage(String),

    #[error("message serialization failed: {0}")]
    Serialization(String),

    #[error("unsupported broker url '{0}'")]
    UnsupportedUrl(String),
}

impl Classify for MessagingError {
    fn class(&self) -> ErrorClass {
        match self {
            MessagingError::Unavailable(_) | MessagingError::Storage(_) => ErrorClass::Transient,
            MessagingError::Serialization(_) | MessagingError::UnsupportedUrl(_) => {
                ErrorClass::Permanent
            }
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for MessagingError {
    fn from(err: rusqlite::Error) -> Self {
        MessagingError::Storage(err.to_string())
    }
}

/// Delivery guarantee currently in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// At-least-once through a durable broker
    Durable,
    /// In-process queue, lost on crash
    BestEffort,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Durable => f.write_str("durable"),
            DeliveryMode::BestEffort => f.write_str("best_effort"),
        }
    }
}

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub subject: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            payload,
            headers: BTreeMap::new(),
            published_at: Utc::now(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message handed out by a broker, before it is bound to its broker handle.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub message: Message,
    pub sequence: u64,
    /// 1 on first delivery
    pub delivery_count: u32,
}

/// Broker backend. Each `(subject, consumer)` pair owns a cursor into the
/// subject log plus a set of deliveries awaiting acknowledgement.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    fn name(&self) -> &'static str;

    fn mode(&self) -> DeliveryMode;

    /// Append to the subject log; returns the sequence number.
    async fn publish(&self, message: Message) -> Result<u64, MessagingError>;

    /// Register a durable consumer so messages published from now on are kept for it.
    async fn ensure_consumer(&self, subject: &str, consumer: &str) -> Result<(), MessagingError>;

    /// Next delivery for `consumer`, waiting up to `wait`. Redeliveries whose
    /// ack deadline passed come before unseen messages.
    async fn fetch(
        &self,
        subject: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<RawDelivery>, MessagingError>;

    /// Acknowledge; acking an unknown or already acked sequence is a no-op.
    async fn ack(&self, subject: &str, consumer: &str, sequence: u64) -> Result<(), MessagingError>;

    /// Release for redelivery after `delay`.
    async fn nak(
        &self,
        subject: &str,
        consumer: &str,
        sequence: u64,
        delay: Duration,
    ) -> Result<(), MessagingError>;

    /// Push the redelivery deadline of a pending delivery out by another
    /// `ack_wait`. No-op when the sequence is no longer pending.
    async fn touch(&self, subject: &str, consumer: &str, sequence: u64) -> Result<(), MessagingError>;

    /// The last local subscriber of `consumer` went away. Brokers whose
    /// consumers outlive the process keep it and expire it by inactivity.
    fn release_consumer(&self, _subject: &str, _consumer: &str) {}
}

/// A received message bound to the broker that delivered it.
pub struct Delivery {
    raw: RawDelivery,
    subject: String,
    consumer: String,
    broker: Arc<dyn MessageBroker>,
    lease: Mutex<Option<DropGuard>>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("consumer", &self.consumer)
            .field("sequence", &self.raw.sequence)
            .field("delivery_count", &self.raw.delivery_count)
            .field("broker", &self.broker.name())
            .finish()
    }
}

impl Delivery {
    pub fn message(&self) -> &Message {
        &self.raw.message
    }

    pub fn sequence(&self) -> u64 {
        self.raw.sequence
    }

    pub fn delivery_count(&self) -> u32 {
        self.raw.delivery_count
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        Ok(serde_json::from_value(self.raw.message.payload.clone())?)
    }

    /// Renew the ack deadline every `every` until the delivery is settled,
    /// dropped, or `token` is cancelled.
    pub fn keep_alive(&self, every: Duration, token: CancellationToken) {
        let broker = self.broker.clone();
        let subject = self.subject.clone();
        let consumer = self.consumer.clone();
        let sequence = self.raw.sequence;
        let every = every.max(Duration::from_millis(1));
        let renewals = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = renewals.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = broker.touch(&subject, &consumer, sequence).await {
                            warn!(subject = %subject, consumer = %consumer, sequence, error = %err, "Failed to renew delivery lease");
                        }
                    }
                }
            }
        });
        *self.lease.lock() = Some(token.drop_guard());
    }

    fn end_lease(&self) {
        self.lease.lock().take();
    }

    pub async fn ack(&self) -> Result<(), MessagingError> {
        self.end_lease();
        self.broker
            .ack(&self.subject, &self.consumer, self.raw.sequence)
            .await
    }

    pub async fn nak(&self, delay: Duration) -> Result<(), MessagingError> {
        self.end_lease();
        self.broker
            .nak(&self.subject, &self.consumer, self.raw.sequence, delay)
            .await
    }
}

/// Entry point used by runtimes and the orchestrator.
pub struct MessagingSubstrate {
    config: MessagingConfig,
    resilience: Arc<ResilienceLayer>,
    broker: RwLock<Arc<dyn MessageBroker>>,
    degraded: AtomicBool,
    /// Live local subscriptions per `(subject, consumer)`
    subscribers: DashMap<(String, String), usize>,
}

impl fmt::Debug for MessagingSubstrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingSubstrate")
            .field("broker", &self.current().name())
            .field("mode", &self.mode())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

fn is_in_process_url(url: &str) -> bool {
    url.is_empty() || url == "memory://" || url == "memory"
}

impl MessagingSubstrate {
    /// In-process substrate, best-effort delivery.
    pub fn in_process(config: MessagingConfig) -> Arc<Self> {
        Self::with_broker(
            Arc::new(InMemoryBroker::new(config.clone())),
            config,
            Arc::new(ResilienceLayer::default()),
        )
    }

    pub fn with_broker(
        broker: Arc<dyn MessageBroker>,
        config: MessagingConfig,
        resilience: Arc<ResilienceLayer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resilience,
            broker: RwLock::new(broker),
            degraded: AtomicBool::new(false),
            subscribers: DashMap::new(),
        })
    }

    /// Connect to the configured broker. Never fails: when the durable broker
    /// cannot be opened the substrate runs in-process and reports degraded.
    pub async fn connect(config: MessagingConfig, resilience: Arc<ResilienceLayer>) -> Arc<Self> {
        let url = config.broker_url.clone().unwrap_or_default();
        if is_in_process_url(&url) {
            info!("No durable broker configured, using in-process delivery");
            return Self::with_broker(
                Arc::new(InMemoryBroker::new(config.clone())),
                config,
                resilience,
            );
        }

        match Self::open_durable(&url, &config, &resilience).await {
            Ok(broker) => {
                info!(broker = broker.name(), url = %url, "Connected to durable broker");
                Self::with_broker(broker, config, resilience)
            }
            Err(err) => {
                warn!(
                    url = %url,
                    error = %err,
                    "Durable broker unreachable, falling back to in-process delivery"
                );
                let substrate = Self::with_broker(
                    Arc::new(InMemoryBroker::new(config.clone())),
                    config,
                    resilience,
                );
                substrate.degraded.store(true, Ordering::SeqCst);
                substrate
            }
        }
    }

    async fn open_durable(
        url: &str,
        config: &MessagingConfig,
        resilience: &ResilienceLayer,
    ) -> Result<Arc<dyn MessageBroker>, ResilienceError<MessagingError>> {
        let path = url.strip_prefix("sqlite://").ok_or_else(|| ResilienceError::Permanent {
            destination: BROKER_DESTINATION.to_string(),
            error: MessagingError::UnsupportedUrl(url.to_string()),
        })?;

        let broker = resilience
            .call(BROKER_DESTINATION, || {
                let config = config.clone();
                async move {
                    if path == ":memory:" {
                        SqliteBroker::in_memory(config).await
                    } else {
                        SqliteBroker::open(path, config).await
                    }
                }
            })
            .await?;
        Ok(Arc::new(broker))
    }

    fn current(&self) -> Arc<dyn MessageBroker> {
        self.broker.read().clone()
    }

    pub fn mode(&self) -> DeliveryMode {
        self.current().mode()
    }

    /// True once the substrate fell back from a configured durable broker.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    fn degrade(&self, reason: &str) {
        let mut broker = self.broker.write();
        if broker.mode() == DeliveryMode::BestEffort {
            return;
        }
        warn!(
            broker = broker.name(),
            reason,
            "Lost durable broker, switching to in-process delivery"
        );
        *broker = Arc::new(InMemoryBroker::new(self.config.clone()));
        self.degraded.store(true, Ordering::SeqCst);
    }

    pub async fn publish<T: Serialize>(&self, subject: &str, body: &T) -> Result<u64, MessagingError> {
        let message = Message::new(subject, serde_json::to_value(body)?);
        self.publish_message(message).await
    }

    pub async fn publish_message(&self, message: Message) -> Result<u64, MessagingError> {
        let broker = self.current();
        if broker.mode() == DeliveryMode::BestEffort {
            return broker.publish(message).await;
        }

        let outcome = self
            .resilience
            .call(BROKER_DESTINATION, || {
                let broker = broker.clone();
                let message = message.clone();
                async move { broker.publish(message).await }
            })
            .await;

        match outcome {
            Ok(sequence) => Ok(sequence),
            Err(ResilienceError::Permanent { error, .. }) => Err(error),
            Err(err) => {
                self.degrade(&err.to_string());
                self.current().publish(message).await
            }
        }
    }

    /// Durable subscription for `consumer` on `subject`. Subscribers sharing a
    /// consumer name compete for messages.
    pub async fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        consumer: &str,
    ) -> Result<Subscription, MessagingError> {
        *self
            .subscribers
            .entry((subject.to_string(), consumer.to_string()))
            .or_insert(0) += 1;
        let subscription = Subscription {
            substrate: self.clone(),
            subject: subject.to_string(),
            consumer: consumer.to_string(),
        };
        self.current().ensure_consumer(subject, consumer).await?;
        debug!(subject, consumer, "Subscribed");
        Ok(subscription)
    }

    fn unsubscribe(&self, subject: &str, consumer: &str) {
        let key = (subject.to_string(), consumer.to_string());
        if let Entry::Occupied(mut live) = self.subscribers.entry(key) {
            *live.get_mut() -= 1;
            if *live.get() == 0 {
                live.remove();
                self.current().release_consumer(subject, consumer);
                debug!(subject, consumer, "Last subscriber gone");
            }
        }
    }

    async fn fetch(&self, subject: &str, consumer: &str) -> Result<Option<Delivery>, MessagingError> {
        let broker = self.current();
        let wait = self.config.fetch_wait;

        let raw = if broker.mode() == DeliveryMode::BestEffort {
            broker.fetch(subject, consumer, wait).await?
        } else {
            let outcome = self
                .resilience
                .call(BROKER_DESTINATION, || {
                    let broker = broker.clone();
                    async move { broker.fetch(subject, consumer, wait).await }
                })
                .await;
            match outcome {
                Ok(raw) => raw,
                Err(ResilienceError::Permanent { error, .. }) => return Err(error),
                Err(err) => {
                    self.degrade(&err.to_string());
                    return Ok(None);
                }
            }
        };

        Ok(raw.map(|raw| Delivery {
            raw,
            subject: subject.to_string(),
            consumer: consumer.to_string(),
            broker,
            lease: Mutex::new(None),
        }))
    }
}

/// Pull side of a durable consumer.
pub struct Subscription {
    substrate: Arc<MessagingSubstrate>,
    subject: String,
    consumer: String,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Next delivery, or `None` once `cancel` fires. Every fetch is bounded
    /// by `fetch_wait`, so cancellation is observed within that interval.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<Delivery> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.substrate.fetch(&self.subject, &self.consumer).await {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => {}
                Err(err) => {
                    warn!(subject = %self.subject, consumer = %self.consumer, error = %err, "Fetch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.substrate.config.poll_interval) => {}
                    }
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.substrate.unsubscribe(&self.subject, &self.consumer);
    }
}
