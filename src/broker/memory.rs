//! In-process broker.
//!
//! Queues live in a shared map behind one lock. Deliveries stay unacked
//! until acked or nacked; when the broker goes unavailable every unacked
//! delivery returns to the front of its queue, like a dropped AMQP channel.

use super::{Broker, Connection, Delivery};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<BrokerState>,
    /// Woken on publish, requeue and availability changes.
    activity: Notify,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            state: Mutex::new(BrokerState {
                available: true,
                generation: 0,
                next_tag: 1,
                queues: HashMap::new(),
            }),
            activity: Notify::new(),
        }
    }
}

struct BrokerState {
    available: bool,
    /// Bumped on every outage; connections from an older generation are dead.
    generation: u64,
    next_tag: i64,
    queues: HashMap<String, MemoryQueue>,
}

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<Stored>,
    unacked: HashMap<i64, Stored>,
}

struct Stored {
    body: Vec<u8>,
    deliveries: u32,
    enqueued_at: DateTime<Utc>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    ///
    /// Going down kills every open connection and returns unacked
    /// deliveries to their queues.
    pub fn set_available(&self, available: bool) {
        {
            let mut state = self.shared.lock();
            if state.available && !available {
                state.generation += 1;
                for queue in state.queues.values_mut() {
                    let mut returned: Vec<(i64, Stored)> = queue.unacked.drain().collect();
                    returned.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
                    for (_, stored) in returned {
                        queue.ready.push_front(stored);
                    }
                }
            }
            state.available = available;
        }
        self.shared.activity.notify_waiters();
    }

    /// Number of messages ready for delivery on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Has `queue` been declared?
    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let state = self.shared.lock();
        if !state.available {
            return Err(Error::Connectivity("memory broker unavailable".to_string()));
        }
        Ok(Arc::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            generation: state.generation,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    generation: u64,
}

impl MemoryConnection {
    /// Lock the broker state, failing if this connection has been severed.
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.shared.lock();
        if !state.available || state.generation != self.generation {
            return Err(Error::Connectivity("memory broker connection closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn declare(&self, queue: &str) -> Result<()> {
        self.open_state()?.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        {
            let mut state = self.open_state()?;
            let q = state.queues.get_mut(queue).ok_or_else(|| Error::Publish {
                queue: queue.to_string(),
                reason: "queue not declared".to_string(),
            })?;
            q.ready.push_back(Stored {
                body: body.to_vec(),
                deliveries: 0,
                enqueued_at: Utc::now(),
            });
        }
        self.shared.activity.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let activity = self.shared.activity.notified();
            tokio::pin!(activity);
            activity.as_mut().enable();

            {
                let mut state = self.open_state()?;
                let tag = state.next_tag;
                if let Some(q) = state.queues.get_mut(queue)
                    && let Some(stored) = q.ready.pop_front()
                {
                    let delivery = Delivery {
                        tag,
                        redelivered: stored.deliveries,
                        enqueued_at: stored.enqueued_at,
                        body: stored.body.clone(),
                    };
                    q.unacked.insert(tag, stored);
                    state.next_tag += 1;
                    return Ok(Some(delivery));
                }
            }

            if tokio::time::timeout_at(deadline, activity).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, queue: &str, tag: i64) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(q) = state.queues.get_mut(queue) {
            q.unacked.remove(&tag);
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, tag: i64, requeue: bool) -> Result<()> {
        {
            let mut state = self.open_state()?;
            if let Some(q) = state.queues.get_mut(queue)
                && let Some(mut stored) = q.unacked.remove(&tag)
                && requeue
            {
                stored.deliveries += 1;
                q.ready.push_back(stored);
            }
        }
        if requeue {
            self.shared.activity.notify_waiters();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        let state = self.shared.lock();
        state.available && state.generation == self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn publish_receive_ack() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare("q").await.unwrap();
        conn.publish("q", b"one").await.unwrap();

        let d = conn.receive("q", WAIT).await.unwrap().expect("delivery");
        assert_eq!(d.body, b"one");
        assert_eq!(d.redelivered, 0);
        conn.ack("q", d.tag).await.unwrap();
        assert!(conn.receive("q", WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_requeue_counts_redelivery() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare("q").await.unwrap();
        conn.publish("q", b"x").await.unwrap();

        let d = conn.receive("q", WAIT).await.unwrap().unwrap();
        conn.nack("q", d.tag, true).await.unwrap();
        let again = conn.receive("q", WAIT).await.unwrap().unwrap();
        assert_eq!(again.redelivered, 1);

        conn.nack("q", again.tag, false).await.unwrap();
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn publish_to_undeclared_queue_is_rejected() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let err = conn.publish("missing", b"x").await.unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
    }

    #[tokio::test]
    async fn outage_severs_connections_and_returns_unacked() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare("q").await.unwrap();
        conn.publish("q", b"a").await.unwrap();
        let _unacked = conn.receive("q", WAIT).await.unwrap().unwrap();

        broker.set_available(false);
        assert!(!conn.is_open());
        assert!(matches!(
            conn.publish("q", b"b").await,
            Err(Error::Connectivity(_))
        ));
        assert!(broker.connect().await.is_err());

        broker.set_available(true);
        assert_eq!(broker.depth("q"), 1);
        let fresh = broker.connect().await.unwrap();
        let d = fresh.receive("q", WAIT).await.unwrap().unwrap();
        assert_eq!(d.body, b"a");
    }

    #[tokio::test]
    async fn receive_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        conn.declare("q").await.unwrap();

        let publisher = broker.connect().await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("q", b"late").await.unwrap();
        });

        let d = conn.receive("q", Duration::from_secs(2)).await.unwrap();
        assert_eq!(d.unwrap().body, b"late");
    }
}
