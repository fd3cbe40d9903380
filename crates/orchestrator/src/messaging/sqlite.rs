//! Durable broker on a SQLite file.
//!
//! The subject log, consumer cursors and pending acknowledgements live in
//! three tables. Every fetch runs in an immediate transaction so several
//! processes can share one database file as competing consumers.
//!
//! Consumers outlive the process that created them. A consumer that has not
//! fetched or renewed a lease within `consumer_inactive_threshold` is removed
//! by the next prune, and messages on a subject without consumers are kept
//! for `unconsumed_retention` only.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DeliveryMode, Message, MessageBroker, MessagingError, RawDelivery};
use crate::config::MessagingConfig;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS broker_messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    published_at TEXT NOT NULL,
    published_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS broker_consumers (
    subject TEXT NOT NULL,
    name TEXT NOT NULL,
    cursor INTEGER NOT NULL DEFAULT 0,
    last_seen_ms INTEGER NOT NULL,
    PRIMARY KEY (subject, name)
);

CREATE TABLE IF NOT EXISTS broker_pending (
    subject TEXT NOT NULL,
    consumer TEXT NOT NULL,
    seq INTEGER NOT NULL,
    deliveries INTEGER NOT NULL,
    ready_at_ms INTEGER NOT NULL,
    PRIMARY KEY (subject, consumer, seq)
);

CREATE INDEX IF NOT EXISTS idx_broker_messages_subject ON broker_messages(subject, seq);
CREATE INDEX IF NOT EXISTS idx_broker_pending_ready ON broker_pending(subject, consumer, ready_at_ms);
"#;

/// SQLite backed durable broker
pub struct SqliteBroker {
    conn: Arc<Mutex<Connection>>,
    ack_wait_ms: i64,
    max_deliver: u32,
    poll_interval: Duration,
    retention_ms: i64,
    inactive_ms: i64,
}

const UPSERT_CONSUMER: &str = "INSERT INTO broker_consumers (subject, name, cursor, last_seen_ms) VALUES (?1, ?2, 0, ?3)
     ON CONFLICT (subject, name) DO UPDATE SET last_seen_ms = excluded.last_seen_ms";

impl SqliteBroker {
    pub async fn open<P: AsRef<Path>>(path: P, config: MessagingConfig) -> Result<Self, MessagingError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| MessagingError::Unavailable(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init(conn, config)
    }

    /// Private database, mostly for tests.
    pub async fn in_memory(config: MessagingConfig) -> Result<Self, MessagingError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MessagingError::Unavailable(e.to_string()))?;
        Self::init(conn, config)
    }

    fn init(conn: Connection, config: MessagingConfig) -> Result<Self, MessagingError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ack_wait_ms: config.ack_wait.as_millis() as i64,
            max_deliver: config.max_deliver,
            poll_interval: config.poll_interval,
            retention_ms: config.unconsumed_retention.as_millis() as i64,
            inactive_ms: config.consumer_inactive_threshold.as_millis() as i64,
        })
    }

    /// Messages still stored for `subject`.
    pub async fn retained(&self, subject: &str) -> Result<u64, MessagingError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM broker_messages WHERE subject = ?1",
            params![subject],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn take_next(
        conn: &mut Connection,
        subject: &str,
        consumer: &str,
        ack_wait_ms: i64,
        max_deliver: u32,
    ) -> Result<Option<RawDelivery>, MessagingError> {
        let now = Utc::now().timestamp_millis();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(UPSERT_CONSUMER, params![subject, consumer, now])?;

        let delivery = loop {
            let ready: Option<(i64, u32)> = tx
                .query_row(
                    "SELECT seq, deliveries FROM broker_pending
                     WHERE subject = ?1 AND consumer = ?2 AND ready_at_ms <= ?3
                     ORDER BY seq LIMIT 1",
                    params![subject, consumer, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((seq, deliveries)) = ready {
                let body: Option<String> = tx
                    .query_row(
                        "SELECT body FROM broker_messages WHERE seq = ?1",
                        params![seq],
                        |row| row.get(0),
                    )
                    .optional()?;

                match body {
                    Some(body) if deliveries < max_deliver => {
                        tx.execute(
                            "UPDATE broker_pending SET deliveries = deliveries + 1, ready_at_ms = ?4
                             WHERE subject = ?1 AND consumer = ?2 AND seq = ?3",
                            params![subject, consumer, seq, now + ack_wait_ms],
                        )?;
                        break Some(RawDelivery {
                            message: serde_json::from_str(&body)?,
                            sequence: seq as u64,
                            delivery_count: deliveries + 1,
                        });
                    }
                    _ => {
                        warn!(subject, consumer, sequence = seq, deliveries, "Dropping message after max deliveries");
                        tx.execute(
                            "DELETE FROM broker_pending WHERE subject = ?1 AND consumer = ?2 AND seq = ?3",
                            params![subject, consumer, seq],
                        )?;
                        continue;
                    }
                }
            }

            let cursor: i64 = tx.query_row(
                "SELECT cursor FROM broker_consumers WHERE subject = ?1 AND name = ?2",
                params![subject, consumer],
                |row| row.get(0),
            )?;
            let next: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, body FROM broker_messages
                     WHERE subject = ?1 AND seq > ?2 ORDER BY seq LIMIT 1",
                    params![subject, cursor],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match next {
                Some((seq, body)) => {
                    tx.execute(
                        "UPDATE broker_consumers SET cursor = ?3 WHERE subject = ?1 AND name = ?2",
                        params![subject, consumer, seq],
                    )?;
                    tx.execute(
                        "INSERT INTO broker_pending (subject, consumer, seq, deliveries, ready_at_ms)
                         VALUES (?1, ?2, ?3, 1, ?4)",
                        params![subject, consumer, seq, now + ack_wait_ms],
                    )?;
                    break Some(RawDelivery {
                        message: serde_json::from_str(&body)?,
                        sequence: seq as u64,
                        delivery_count: 1,
                    });
                }
                None => break None,
            }
        };

        tx.commit()?;
        Ok(delivery)
    }

    /// Expire inactive consumers of `subject`, then delete messages every
    /// remaining consumer is done with, or that outlived the retention window
    /// when none remain.
    fn prune(&self, conn: &mut Connection, subject: &str) -> Result<usize, MessagingError> {
        let now = Utc::now().timestamp_millis();
        let stale_before = now - self.inactive_ms;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM broker_pending WHERE subject = ?1 AND consumer IN
               (SELECT name FROM broker_consumers WHERE subject = ?1 AND last_seen_ms < ?2)",
            params![subject, stale_before],
        )?;
        let expired = tx.execute(
            "DELETE FROM broker_consumers WHERE subject = ?1 AND last_seen_ms < ?2",
            params![subject, stale_before],
        )?;
        if expired > 0 {
            warn!(subject, expired, "Removed inactive consumers");
        }

        let consumed = tx.execute(
            "DELETE FROM broker_messages
             WHERE subject = ?1
               AND seq <= (SELECT MIN(cursor) FROM broker_consumers WHERE subject = ?1)
               AND seq NOT IN (SELECT seq FROM broker_pending WHERE subject = ?1)",
            params![subject],
        )?;
        let unconsumed = tx.execute(
            "DELETE FROM broker_messages
             WHERE subject = ?1
               AND published_ms < ?2
               AND NOT EXISTS (SELECT 1 FROM broker_consumers WHERE subject = ?1)",
            params![subject, now - self.retention_ms],
        )?;
        tx.commit()?;
        Ok(consumed + unconsumed)
    }
}

#[async_trait]
impl MessageBroker for SqliteBroker {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Durable
    }

    async fn publish(&self, message: Message) -> Result<u64, MessagingError> {
        let body = serde_json::to_string(&message)?;
        let mut conn = self.conn.lock().await;
        self.prune(&mut conn, &message.subject)?;
        conn.execute(
            "INSERT INTO broker_messages (subject, body, published_at, published_ms) VALUES (?1, ?2, ?3, ?4)",
            params![
                message.subject,
                body,
                message.published_at.to_rfc3339(),
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    async fn ensure_consumer(&self, subject: &str, consumer: &str) -> Result<(), MessagingError> {
        let conn = self.conn.lock().await;
        conn.execute(UPSERT_CONSUMER, params![subject, consumer, Utc::now().timestamp_millis()])?;
        Ok(())
    }

    async fn fetch(
        &self,
        subject: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<RawDelivery>, MessagingError> {
        let started = tokio::time::Instant::now();
        loop {
            let taken = {
                let mut conn = self.conn.lock().await;
                Self::take_next(&mut conn, subject, consumer, self.ack_wait_ms, self.max_deliver)?
            };
            if taken.is_some() {
                return Ok(taken);
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(wait - elapsed)).await;
        }
    }

    async fn ack(&self, subject: &str, consumer: &str, sequence: u64) -> Result<(), MessagingError> {
        let mut conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM broker_pending WHERE subject = ?1 AND consumer = ?2 AND seq = ?3",
            params![subject, consumer, sequence as i64],
        )?;
        if removed > 0 {
            let pruned = self.prune(&mut conn, subject)?;
            if pruned > 0 {
                debug!(subject, pruned, "Pruned acknowledged messages");
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
        let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE broker_pending SET ready_at_ms = ?4 WHERE subject = ?1 AND consumer = ?2 AND seq = ?3",
            params![subject, consumer, sequence as i64, ready_at],
        )?;
        Ok(())
    }

    async fn touch(&self, subject: &str, consumer: &str, sequence: u64) -> Result<(), MessagingError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE broker_pending SET ready_at_ms = ?4 WHERE subject = ?1 AND consumer = ?2 AND seq = ?3",
            params![subject, consumer, sequence as i64, now + self.ack_wait_ms],
        )?;
        conn.execute(
            "UPDATE broker_consumers SET last_seen_ms = ?3 WHERE subject = ?1 AND name = ?2",
            params![subject, consumer, now],
        )?;
        Ok(())
    }
}
