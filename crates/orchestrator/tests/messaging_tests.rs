//! Durable delivery on the SQLite broker and the in-process fallback.

use anyhow::Result;
use async_trait::async_trait;
use orchestrator::messaging::{InMemoryBroker, Message, MessageBroker, RawDelivery, SqliteBroker, Subscription};
use orchestrator::reliability::{BackoffStrategy, RetryConfig};
use orchestrator::{
    DeliveryMode, MessagingConfig, MessagingError, MessagingSubstrate, ResilienceConfig, ResilienceLayer,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config() -> MessagingConfig {
    MessagingConfig {
        ack_wait: Duration::from_millis(150),
        max_deliver: 3,
        fetch_wait: Duration::from_millis(50),
        poll_interval: Duration::from_millis(10),
        ..MessagingConfig::default()
    }
}

fn quick_resilience() -> Arc<ResilienceLayer> {
    Arc::new(ResilienceLayer::new(ResilienceConfig {
        retry: RetryConfig {
            max_attempts: 2,
            max_duration: Duration::from_secs(1),
            backoff: BackoffStrategy::Fixed {
                delay: Duration::from_millis(1),
            },
        },
        ..ResilienceConfig::default()
    }))
}

/// Next delivery within `wait`, or `None`.
async fn next_within(sub: &mut Subscription, wait: Duration) -> Option<orchestrator::messaging::Delivery> {
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        stopper.cancel();
    });
    let delivery = sub.next(&cancel).await;
    timer.abort();
    delivery
}

async fn durable(path: &std::path::Path) -> Result<Arc<MessagingSubstrate>> {
    let broker = SqliteBroker::open(path, config()).await?;
    Ok(MessagingSubstrate::with_broker(Arc::new(broker), config(), quick_resilience()))
}

#[tokio::test]
async fn test_nak_and_unacked_messages_are_redelivered() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let substrate = durable(&dir.path().join("broker.db")).await?;
    assert_eq!(substrate.mode(), DeliveryMode::Durable);

    let mut sub = substrate.subscribe("tasks.echo", "workers.echo").await?;
    substrate.publish("tasks.echo", &json!({ "n": 1 })).await?;

    let first = next_within(&mut sub, Duration::from_secs(2)).await.expect("first delivery");
    assert_eq!(first.delivery_count(), 1);
    first.nak(Duration::ZERO).await?;

    let second = next_within(&mut sub, Duration::from_secs(2)).await.expect("redelivery after nak");
    assert_eq!(second.sequence(), first.sequence());
    assert_eq!(second.delivery_count(), 2);
    // neither acked nor nacked: comes back after ack_wait
    drop(second);

    let third = next_within(&mut sub, Duration::from_secs(2)).await.expect("redelivery after ack wait");
    assert_eq!(third.delivery_count(), 3);
    assert_eq!(third.decode::<Value>()?, json!({ "n": 1 }));
    third.ack().await?;

    assert!(next_within(&mut sub, Duration::from_millis(300)).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_messages_survive_broker_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("broker.db");

    {
        let substrate = durable(&path).await?;
        let _sub = substrate.subscribe("tasks.report", "workers.report").await?;
        substrate.publish("tasks.report", &json!("pending work")).await?;
    }

    let substrate = durable(&path).await?;
    let mut sub = substrate.subscribe("tasks.report", "workers.report").await?;
    let delivery = next_within(&mut sub, Duration::from_secs(2)).await.expect("retained message");
    assert_eq!(delivery.decode::<String>()?, "pending work");
    delivery.ack().await?;
    Ok(())
}

#[tokio::test]
async fn test_competing_consumers_share_a_partition() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let substrate = durable(&dir.path().join("broker.db")).await?;
    let mut a = substrate.subscribe("tasks.split", "workers.split").await?;
    let mut b = substrate.subscribe("tasks.split", "workers.split").await?;

    for n in 0..2 {
        substrate.publish("tasks.split", &json!(n)).await?;
    }
    let first = next_within(&mut a, Duration::from_secs(2)).await.expect("a gets one");
    let second = next_within(&mut b, Duration::from_secs(2)).await.expect("b gets the other");
    assert_ne!(first.sequence(), second.sequence());
    first.ack().await?;
    second.ack().await?;
    Ok(())
}

#[tokio::test]
async fn test_unreachable_broker_falls_back_to_best_effort() -> Result<()> {
    let unreachable = MessagingConfig {
        broker_url: Some("sqlite:///nonexistent-dir/for/sure/broker.db".into()),
        ..config()
    };
    let substrate = MessagingSubstrate::connect(unreachable, quick_resilience()).await;
    assert!(substrate.is_degraded());
    assert_eq!(substrate.mode(), DeliveryMode::BestEffort);

    // still usable in-process
    let mut sub = substrate.subscribe("tasks.x", "workers.x").await?;
    substrate.publish("tasks.x", &json!(true)).await?;
    let delivery = next_within(&mut sub, Duration::from_secs(2)).await.expect("in-process delivery");
    delivery.ack().await?;

    let unsupported = MessagingConfig {
        broker_url: Some("nats://localhost:4222".into()),
        ..config()
    };
    let substrate = MessagingSubstrate::connect(unsupported, quick_resilience()).await;
    assert!(substrate.is_degraded());
    Ok(())
}

#[tokio::test]
async fn test_no_broker_configured_is_not_degraded() {
    let substrate = MessagingSubstrate::connect(MessagingConfig::default(), quick_resilience()).await;
    assert_eq!(substrate.mode(), DeliveryMode::BestEffort);
    assert!(!substrate.is_degraded());
}

/// Durable-looking broker that starts failing every call once `down` is set.
struct Unplugged {
    down: AtomicBool,
    inner: InMemoryBroker,
}

impl Unplugged {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            down: AtomicBool::new(false),
            inner: InMemoryBroker::new(config()),
        })
    }

    fn check(&self) -> Result<(), MessagingError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(MessagingError::Unavailable("connection reset".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for Unplugged {
    fn name(&self) -> &'static str {
        "unplugged"
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Durable
    }

    async fn publish(&self, message: Message) -> Result<u64, MessagingError> {
        self.check()?;
        self.inner.publish(message).await
    }

    async fn ensure_consumer(&self, subject: &str, consumer: &str) -> Result<(), MessagingError> {
        self.check()?;
        self.inner.ensure_consumer(subject, consumer).await
    }

    async fn fetch(&self, subject: &str, consumer: &str, wait: Duration) -> Result<Option<RawDelivery>, MessagingError> {
        self.check()?;
        self.inner.fetch(subject, consumer, wait).await
    }

    async fn ack(&self, subject: &str, consumer: &str, sequence: u64) -> Result<(), MessagingError> {
        self.check()?;
        self.inner.ack(subject, consumer, sequence).await
    }

    async fn nak(&self, subject: &str, consumer: &str, sequence: u64, delay: Duration) -> Result<(), MessagingError> {
        self.check()?;
        self.inner.nak(subject, consumer, sequence, delay).await
    }

    async fn touch(&self, subject: &str, consumer: &str, sequence: u64) -> Result<(), MessagingError> {
        self.check()?;
        self.inner.touch(subject, consumer, sequence).await
    }
}

#[tokio::test]
async fn test_publish_degrades_to_in_process_when_broker_is_lost() -> Result<()> {
    let broker = Unplugged::new();
    let substrate = MessagingSubstrate::with_broker(broker.clone(), config(), quick_resilience());
    assert_eq!(substrate.mode(), DeliveryMode::Durable);

    substrate.publish("tasks.a", &json!("before")).await?;
    assert!(!substrate.is_degraded());

    broker.down.store(true, Ordering::SeqCst);
    substrate.publish("tasks.a", &json!("after")).await?;
    assert!(substrate.is_degraded());
    assert_eq!(substrate.mode(), DeliveryMode::BestEffort);

    // the publish completed on the fallback broker
    let mut sub = substrate.subscribe("tasks.a", "workers.a").await?;
    let delivery = next_within(&mut sub, Duration::from_secs(2)).await.expect("fallback delivery");
    assert_eq!(delivery.decode::<String>()?, "after");
    delivery.ack().await?;
    Ok(())
}

#[tokio::test]
async fn test_subscription_survives_broker_loss() -> Result<()> {
    let broker = Unplugged::new();
    let substrate = MessagingSubstrate::with_broker(broker.clone(), config(), quick_resilience());
    let mut sub = substrate.subscribe("tasks.b", "workers.b").await?;

    broker.down.store(true, Ordering::SeqCst);
    assert!(next_within(&mut sub, Duration::from_millis(200)).await.is_none());
    assert!(substrate.is_degraded());
    assert_eq!(substrate.mode(), DeliveryMode::BestEffort);

    substrate.publish("tasks.b", &json!(7)).await?;
    let delivery = next_within(&mut sub, Duration::from_secs(2)).await.expect("delivery after fallback");
    assert_eq!(delivery.decode::<i64>()?, 7);
    delivery.ack().await?;
    Ok(())
}
