//! Process-local broker used when no durable broker is reachable.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use super::{DeliveryMode, Message, MessageBroker, MessagingError, RawDelivery};
use crate::config::MessagingConfig;

#[derive(Debug)]
struct PendingAck {
    ready_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct ConsumerState {
    /// Highest sequence handed out for the first time
    cursor: u64,
    pending: BTreeMap<u64, PendingAck>,
}

impl ConsumerState {
    /// Lowest sequence this consumer may still need.
    fn low_watermark(&self) -> u64 {
        self.pending
            .keys()
            .next()
            .copied()
            .unwrap_or(self.cursor + 1)
    }
}

#[derive(Debug)]
struct Stored {
    message: Message,
    stored_at: Instant,
}

#[derive(Debug)]
struct SubjectLog {
    next_sequence: u64,
    messages: BTreeMap<u64, Stored>,
    consumers: HashMap<String, ConsumerState>,
    notify: Arc<Notify>,
}

impl SubjectLog {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            messages: BTreeMap::new(),
            consumers: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Drop messages every known consumer is done with. Without consumers,
    /// messages are kept for `retention` so a late subscriber still sees them.
    fn collect_garbage(&mut self, now: Instant, retention: Duration) {
        match self.consumers.values().map(ConsumerState::low_watermark).min() {
            Some(floor) => self.messages = self.messages.split_off(&floor),
            None => {
                while let Some(oldest) = self.messages.first_entry() {
                    if now.saturating_duration_since(oldest.get().stored_at) < retention {
                        break;
                    }
                    oldest.remove();
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.messages.is_empty() && self.consumers.is_empty()
    }
}

enum Take {
    Delivered(RawDelivery),
    Empty { next_ready: Option<Instant> },
}

/// In-process broker with the same cursor/pending semantics as the durable one.
#[derive(Debug)]
pub struct InMemoryBroker {
    ack_wait: Duration,
    max_deliver: u32,
    retention: Duration,
    subjects: Mutex<HashMap<String, SubjectLog>>,
    last_sweep: Mutex<Instant>,
}

impl InMemoryBroker {
    pub fn new(config: MessagingConfig) -> Self {
        Self {
            ack_wait: config.ack_wait,
            max_deliver: config.max_deliver,
            retention: config.unconsumed_retention,
            subjects: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Subjects currently tracked, with or without retained messages.
    pub fn subject_count(&self) -> usize {
        self.subjects.lock().len()
    }

    /// Collect every subject, at most once per quarter retention window.
    fn sweep(&self, subjects: &mut HashMap<String, SubjectLog>, now: Instant) {
        {
            let mut last = self.last_sweep.lock();
            if now.saturating_duration_since(*last) < self.retention / 4 {
                return;
            }
            *last = now;
        }
        for log in subjects.values_mut() {
            log.collect_garbage(now, self.retention);
        }
        subjects.retain(|_, log| !log.is_idle());
    }

    /// Messages still retained for `subject`.
    pub fn retained(&self, subject: &str) -> usize {
        self.subjects
            .lock()
            .get(subject)
            .map(|log| log.messages.len())
            .unwrap_or(0)
    }

    fn notifier(&self, subject: &str) -> Arc<Notify> {
        self.subjects
            .lock()
            .entry(subject.to_string())
            .or_insert_with(SubjectLog::new)
            .notify
            .clone()
    }

    fn try_take(&self, subject: &str, consumer: &str) -> Take {
        let now = Instant::now();
        let mut subjects = self.subjects.lock();
        let log = subjects
            .entry(subject.to_string())
            .or_insert_with(SubjectLog::new);
        let SubjectLog {
            messages,
            consumers,
            ..
        } = &mut *log;
        let state = consumers.entry(consumer.to_string()).or_default();

        let mut dropped = false;
        let redelivery = loop {
            let ready = state
                .pending
                .iter()
                .find(|(_, p)| p.ready_at <= now)
                .map(|(seq, p)| (*seq, p.deliveries));
            match ready {
                Some((sequence, deliveries)) if deliveries >= self.max_deliver => {
                    warn!(subject, consumer, sequence, deliveries, "Dropping message after max deliveries");
                    state.pending.remove(&sequence);
                    dropped = true;
                }
                Some((sequence, deliveries)) => match messages.get(&sequence) {
                    Some(Stored { message, .. }) => {
                        if let Some(entry) = state.pending.get_mut(&sequence) {
                            entry.deliveries += 1;
                            entry.ready_at = now + self.ack_wait;
                        }
                        break Some(RawDelivery {
                            message: message.clone(),
                            sequence,
                            delivery_count: deliveries + 1,
                        });
                    }
                    None => {
                        state.pending.remove(&sequence);
                    }
                },
                None => break None,
            }
        };

        let taken = redelivery.or_else(|| {
            let (sequence, Stored { message, .. }) = messages.range(state.cursor + 1..).next()?;
            let sequence = *sequence;
            state.cursor = sequence;
            state.pending.insert(
                sequence,
                PendingAck {
                    ready_at: now + self.ack_wait,
                    deliveries: 1,
                },
            );
            Some(RawDelivery {
                message: message.clone(),
                sequence,
                delivery_count: 1,
            })
        });

        let next_ready = state.pending.values().map(|p| p.ready_at).min();
        if dropped {
            log.collect_garbage(now, self.retention);
        }

        match taken {
            Some(delivery) => Take::Delivered(delivery),
            None => Take::Empty { next_ready },
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::BestEffort
    }

    async fn publish(&self, mut message: Message) -> Result<u64, MessagingError> {
        let now = Instant::now();
        let mut subjects = self.subjects.lock();
        self.sweep(&mut subjects, now);
        let log = subjects
            .entry(message.subject.clone())
            .or_insert_with(SubjectLog::new);
        log.collect_garbage(now, self.retention);
        let sequence = log.next_sequence;
        log.next_sequence += 1;
        message.headers.insert("sequence".into(), sequence.to_string());
        log.messages.insert(
            sequence,
            Stored {
                message,
                stored_at: now,
            },
        );
        log.notify.notify_waiters();
        Ok(sequence)
    }

    async fn ensure_consumer(&self, subject: &str, consumer: &str) -> Result<(), MessagingError> {
        let mut subjects = self.subjects.lock();
        subjects
            .entry(subject.to_string())
            .or_insert_with(SubjectLog::new)
            .consumers
            .entry(consumer.to_string())
            .or_default();
        Ok(())
    }

    async fn fetch(
        &self,
        subject: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<RawDelivery>, MessagingError> {
        let deadline = Instant::now() + wait;
        let notify = self.notifier(subject);

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take(subject, consumer) {
                Take::Delivered(delivery) => return Ok(Some(delivery)),
                Take::Empty { next_ready } => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    let wake_at = next_ready.map_or(deadline, |ready| ready.min(deadline));
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(wake_at) => {}
                    }
                }
            }
        }
    }

    async fn ack(&self, subject: &str, consumer: &str, sequence: u64) -> Result<(), MessagingError> {
        let mut subjects = self.subjects.lock();
        if let Some(log) = subjects.get_mut(subject) {
            let removed = log
                .consumers
                .get_mut(consumer)
                .and_then(|state| state.pending.remove(&sequence))
                .is_some();
            if removed {
                log.collect_garbage(Instant::now(), self.retention);
            }
        }
        Ok(())
    }

    async fn nak(
        &self,
        subject: &str,
        consumer: &str,
        sequence: u64,
        delay: Duration,
    ) -> Result<(), MessagingError> {
        let mut subjects = self.subjects.lock();
        if let Some(log) = subjects.get_mut(subject) {
            if let Some(entry) = log
                .consumers
                .get_mut(consumer)
                .and_then(|state| state.pending.get_mut(&sequence))
            {
                entry.ready_at = Instant::now() + delay;
            }
            log.notify.notify_waiters();
        }
        Ok(())
    }

    async fn touch(&self, subject: &str, consumer: &str, sequence: u64) -> Result<(), MessagingError> {
        let mut subjects = self.subjects.lock();
        if let Some(entry) = subjects
            .get_mut(subject)
            .and_then(|log| log.consumers.get_mut(consumer))
            .and_then(|state| state.pending.get_mut(&sequence))
        {
            entry.ready_at = Instant::now() + self.ack_wait;
        }
        Ok(())
    }

    fn release_consumer(&self, subject: &str, consumer: &str) {
        let mut subjects = self.subjects.lock();
        let Some(log) = subjects.get_mut(subject) else {
            return;
        };
        if log.consumers.remove(consumer).is_some() {
            log.collect_garbage(Instant::now(), self.retention);
        }
        if log.is_idle() {
            subjects.remove(subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker(ack_wait_ms: u64, max_deliver: u32) -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::new(MessagingConfig {
            ack_wait: Duration::from_millis(ack_wait_ms),
            max_deliver,
            ..Default::default()
        }))
    }

    async fn publish(broker: &InMemoryBroker, subject: &str, n: u64) -> u64 {
        broker
            .publish(Message::new(subject, json!({ "n": n })))
            .await
            .expect("publish")
    }

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_fifo_per_consumer() {
        let b = broker(1_000, 5);
        b.ensure_consumer("s", "c").await.expect("consumer");
        for n in 0..5 {
            publish(&b, "s", n).await;
        }
        for n in 0..5 {
            let d = b.fetch("s", "c", WAIT).await.expect("fetch").expect("message");
            assert_eq!(d.message.payload["n"], n);
            b.ack("s", "c", d.sequence).await.expect("ack");
        }
        assert!(b.fetch("s", "c", WAIT).await.expect("fetch").is_none());
        assert_eq!(b.retained("s"), 0);
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered_after_ack_wait() {
        let b = broker(30, 5);
        publish(&b, "s", 1).await;

        let first = b.fetch("s", "c", WAIT).await.expect("fetch").expect("message");
        assert_eq!(first.delivery_count, 1);
        assert!(b.fetch("s", "c", Duration::from_millis(5)).await.expect("fetch").is_none());

        let again = b
            .fetch("s", "c", Duration::from_millis(200))
            .await
            .expect("fetch")
            .expect("redelivered");
        assert_eq!(again.sequence, first.sequence);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_nak_redelivers_after_delay() {
        let b = broker(10_000, 5);
        publish(&b, "s", 1).await;
        let d = b.fetch("s", "c", WAIT).await.expect("fetch").expect("message");
        b.nak("s", "c", d.sequence, Duration::from_millis(10)).await.expect("nak");

        let again = b
            .fetch("s", "c", Duration::from_millis(200))
            .await
            .expect("fetch")
            .expect("redelivered");
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_competing_consumers_share_one_cursor() {
        let b = broker(1_000, 5);
        publish(&b, "s", 1).await;
        publish(&b, "s", 2).await;

        let a = b.fetch("s", "workers", WAIT).await.expect("fetch").expect("first");
        let c = b.fetch("s", "workers", WAIT).await.expect("fetch").expect("second");
        assert_ne!(a.sequence, c.sequence);

        // an independent consumer sees everything
        let other = b.fetch("s", "audit", WAIT).await.expect("fetch").expect("copy");
        assert_eq!(other.sequence, a.sequence);
    }

    #[tokio::test]
    async fn test_message_dropped_after_max_deliver() {
        let b = broker(5, 2);
        publish(&b, "s", 1).await;
        let _ = b.fetch("s", "c", WAIT).await.expect("fetch").expect("first");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = b.fetch("s", "c", WAIT).await.expect("fetch").expect("second");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(b.fetch("s", "c", WAIT).await.expect("fetch").is_none());
    }

    #[tokio::test]
    async fn test_touch_postpones_redelivery() {
        let b = broker(60, 5);
        publish(&b, "s", 1).await;
        let first = b.fetch("s", "workers", WAIT).await.expect("fetch").expect("message");

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            b.touch("s", "workers", first.sequence).await.expect("touch");
        }
        assert!(b.fetch("s", "workers", Duration::from_millis(10)).await.expect("fetch").is_none());

        let again = b
            .fetch("s", "workers", Duration::from_millis(200))
            .await
            .expect("fetch")
            .expect("redelivered once renewals stop");
        assert_eq!(again.delivery_count, 2);
    }

    fn short_retention(retention_ms: u64) -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::new(MessagingConfig {
            unconsumed_retention: Duration::from_millis(retention_ms),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_unconsumed_subject_expires_after_retention() {
        let b = short_retention(20);
        publish(&b, "results.nobody", 1).await;
        publish(&b, "results.nobody", 2).await;
        assert_eq!(b.retained("results.nobody"), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        publish(&b, "results.nobody", 3).await;
        assert_eq!(b.retained("results.nobody"), 1);

        // a quiet subject is swept by traffic elsewhere
        tokio::time::sleep(Duration::from_millis(30)).await;
        publish(&b, "other", 1).await;
        assert_eq!(b.retained("results.nobody"), 0);
        assert_eq!(b.subject_count(), 1);
    }

    #[tokio::test]
    async fn test_released_consumer_no_longer_pins_messages() {
        let b = short_retention(20);
        b.ensure_consumer("s", "gone").await.expect("consumer");
        publish(&b, "s", 1).await;
        publish(&b, "s", 2).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        publish(&b, "s", 3).await;
        assert_eq!(b.retained("s"), 3);

        b.release_consumer("s", "gone");
        assert_eq!(b.retained("s"), 1);
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let b = broker(1_000, 5);
        let fetcher = {
            let b = b.clone();
            tokio::spawn(async move { b.fetch("s", "c", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        publish(&b, "s", 9).await;

        let d = fetcher.await.expect("join").expect("fetch").expect("woken");
        assert_eq!(d.message.payload["n"], 9);
    }
}
