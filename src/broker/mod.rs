//! Physical broker transports.
//!
//! The multiplexer talks to the broker only through [`Broker`] and
//! [`Connection`]. Two transports ship with the crate: [`PgmqBroker`]
//! (Postgres + pgmq, visibility-timeout based at-least-once delivery) and
//! [`MemoryBroker`] (in-process, used for tests and single-process runs).

pub mod memory;
pub mod pgmq;

pub use memory::MemoryBroker;
pub use pgmq::PgmqBroker;

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Envelope carried on every broker queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMessage {
    /// Empty string addresses the default consumer of a queue.
    #[serde(default)]
    pub correlation_id: String,
    pub payload: Vec<u8>,
    #[serde(
        default,
        with = "expiration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub expiration: Option<Duration>,
    /// Absolute deadline, fixed when the message is taken off the broker.
    #[serde(skip)]
    expires_at: Option<DateTime<Utc>>,
}

impl BrokerMessage {
    pub fn new(correlation_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload,
            expiration: None,
            expires_at: None,
        }
    }

    /// Build a message whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(correlation_id: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(correlation_id, serde_json::to_vec(value)?))
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Decode the payload as JSON.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::Decode(format!("payload for {:?}: {e}", self.correlation_id)))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::Decode(format!("envelope: {e}")))
    }

    /// Fix the absolute deadline from the time the broker enqueued this
    /// message. Without an expiration there is no deadline.
    pub fn set_enqueued_at(&mut self, enqueued_at: DateTime<Utc>) {
        self.expires_at = self
            .expiration
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| enqueued_at + ttl);
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Past its deadline at `now`. Always false before `set_enqueued_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| deadline < now)
    }

    /// Copy for sending again: the expiration becomes the time left until
    /// the deadline. `None` once the deadline has passed.
    pub fn resend(&self, now: DateTime<Utc>) -> Option<Self> {
        let mut msg = Self::new(self.correlation_id.clone(), self.payload.clone());
        match self.expires_at {
            Some(deadline) => {
                let left = (deadline - now).to_std().ok().filter(|d| !d.is_zero())?;
                msg.expiration = Some(left);
            }
            None => msg.expiration = self.expiration,
        }
        Some(msg)
    }
}

mod expiration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// A message handed out by a [`Connection`], pending ack or nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned handle used to ack/nack this delivery.
    pub tag: i64,
    /// How many times this message was delivered before.
    pub redelivered: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Encoded [`BrokerMessage`].
    pub body: Vec<u8>,
}

/// Factory for physical connections.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a new physical connection. Failures are reported as
    /// [`Error::Connectivity`].
    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}

/// One physical broker connection.
///
/// Any method may fail with [`Error::Connectivity`], after which the
/// connection is considered dead and the multiplexer reconnects.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Create the queue if it does not exist (idempotent).
    async fn declare(&self, queue: &str) -> Result<()>;

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;

    /// Wait up to `wait` for the next delivery on `queue`.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;

    async fn ack(&self, queue: &str, tag: i64) -> Result<()>;

    /// Reject a delivery. With `requeue` it becomes eligible for
    /// redelivery, otherwise it is discarded.
    async fn nack(&self, queue: &str, tag: i64, requeue: bool) -> Result<()>;

    fn is_open(&self) -> bool;
}
