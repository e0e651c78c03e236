//! pgmq transport via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read_with_poll,
//! pgmq.delete (ack), pgmq.set_vt (nack with requeue) and pgmq.archive
//! (nack without requeue). Unacked messages reappear after the visibility
//! timeout, which gives at-least-once delivery across worker crashes.

use super::{Broker, Connection, Delivery};
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use secrecy::{ExposeSecret, SecretString};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

/// Connection settings for the pgmq transport.
#[derive(Debug, Clone)]
pub struct PgmqOptions {
    pub max_connections: u32,
    /// Seconds a received message stays invisible before redelivery.
    pub visibility_timeout: i32,
    /// Seconds a nacked message waits before it becomes visible again.
    pub requeue_delay: i32,
    pub acquire_timeout: Duration,
}

impl Default for PgmqOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            visibility_timeout: 30,
            requeue_delay: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

pub struct PgmqBroker {
    url: SecretString,
    options: PgmqOptions,
}

impl PgmqBroker {
    pub fn new(url: SecretString, options: PgmqOptions) -> Self {
        Self { url, options }
    }
}

#[async_trait]
impl Broker for PgmqBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let pool = PgPoolOptions::new()
            .max_connections(self.options.max_connections)
            .acquire_timeout(self.options.acquire_timeout)
            .connect(self.url.expose_secret())
            .await
            .map_err(classify)?;
        sqlx::query("CREATE EXTENSION IF NOT EXISTS pgmq")
            .execute(&pool)
            .await
            .map_err(classify)?;
        Ok(Arc::new(PgmqConnection {
            pool,
            options: self.options.clone(),
        }))
    }
}

struct PgmqConnection {
    pool: PgPool,
    options: PgmqOptions,
}

/// pgmq queue names become table names and only allow `[a-z0-9_]`.
pub fn physical_name(queue: &str) -> String {
    queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Transport-level failures mean the connection is gone; everything else is
/// a rejected statement.
fn classify(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::Connectivity(e.to_string()),
        other => Error::Storage(other),
    }
}

fn count(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

#[async_trait]
impl Connection for PgmqConnection {
    /// Create a pgmq queue (idempotent).
    async fn declare(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(physical_name(queue))
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        count(queue, "create");
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let message: serde_json::Value = serde_json::from_slice(body)?;
        sqlx::query("SELECT pgmq.send($1, $2, 0)")
            .bind(physical_name(queue))
            .bind(&message)
            .execute(&self.pool)
            .await
            .map_err(|e| match classify(e) {
                Error::Storage(e) => Error::Publish {
                    queue: queue.to_string(),
                    reason: e.to_string(),
                },
                other => other,
            })?;
        count(queue, "send");
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let max_poll_seconds = wait.as_secs().clamp(1, i32::MAX as u64) as i32;
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >(
            "SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read_with_poll($1, $2, 1, $3, 100)",
        )
        .bind(physical_name(queue))
        .bind(self.options.visibility_timeout)
        .bind(max_poll_seconds)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify)?;

        let Some((msg_id, read_ct, enqueued_at, message)) = row else {
            count(queue, "read_empty");
            return Ok(None);
        };
        count(queue, "read");
        Ok(Some(Delivery {
            tag: msg_id,
            redelivered: read_ct.saturating_sub(1).max(0) as u32,
            enqueued_at,
            body: serde_json::to_vec(&message)?,
        }))
    }

    /// Delete a message permanently.
    async fn ack(&self, queue: &str, tag: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(physical_name(queue))
            .bind(tag)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        count(queue, "delete");
        Ok(())
    }

    /// Requeue by shortening the visibility timeout, or archive (moves to
    /// the archive table, preserved for audit).
    async fn nack(&self, queue: &str, tag: i64, requeue: bool) -> Result<()> {
        if requeue {
            sqlx::query("SELECT pgmq.set_vt($1, $2, $3)")
                .bind(physical_name(queue))
                .bind(tag)
                .bind(self.options.requeue_delay)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
            count(queue, "requeue");
        } else {
            sqlx::query("SELECT pgmq.archive($1, $2)")
                .bind(physical_name(queue))
                .bind(tag)
                .execute(&self.pool)
                .await
                .map_err(classify)?;
            count(queue, "archive");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.pool.is_closed()
    }
}
