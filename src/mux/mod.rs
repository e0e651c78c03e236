//! Broker channel multiplexer.
//!
//! One [`Multiplexer`] owns the physical broker connection and exposes any
//! number of logical queues over it. Producers write into a bounded local
//! buffer per queue; consumers read from bounded sub-channels keyed by
//! correlation id. A background connection task keeps the physical side
//! alive: connect, declare, attach dispatchers, and start over when the
//! connection drops.
//!
//! The name → sub-channel registry is the only shared mutable state and
//! sits behind a single lock.

mod session;

use crate::broker::{Broker, BrokerMessage};
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Correlation key of a queue's default consumer.
pub const DEFAULT_KEY: &str = "";

/// Configuration for the multiplexer.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Capacity of each producer buffer.
    pub buffer_capacity: usize,
    /// Capacity of each default consumer channel: how many acknowledged
    /// deliveries may wait locally for a free worker. Keep it small so
    /// competing processes share a backlog.
    pub prefetch: usize,
    /// Capacity of each correlation-keyed response sub-channel.
    pub response_capacity: usize,
    /// Fixed delay between connection attempts.
    pub reconnect_delay: Duration,
    /// Interval of the periodic declare pass and liveness check.
    pub declare_interval: Duration,
    /// Long-poll wait for a single broker receive.
    pub receive_wait: Duration,
    /// Pause after nacking a delivery nobody here wants.
    pub redelivery_backoff: Duration,
    /// How long a delivery for a full default channel is held, unacked,
    /// waiting for a local worker before it is requeued.
    pub hold_timeout: Duration,
    /// Deliveries redelivered more often than this are dropped.
    pub max_redeliveries: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            prefetch: 1,
            response_capacity: 2,
            reconnect_delay: Duration::from_secs(2),
            declare_interval: Duration::from_millis(500),
            receive_wait: Duration::from_secs(1),
            redelivery_backoff: Duration::from_millis(50),
            hold_timeout: Duration::from_secs(5),
            max_redeliveries: 32,
        }
    }
}

/// Physical connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Cloneable handle to the multiplexer. All clones share one connection.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Arc<dyn Broker>,
    config: MuxConfig,
    registry: Mutex<Registry>,
    state: watch::Sender<ConnectionState>,
    /// Wakes the connection task for a declare pass.
    wake: Notify,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Default)]
struct Registry {
    producers: HashMap<String, ProducerSlot>,
    consumers: HashMap<String, ConsumerQueue>,
    declared_producers: HashSet<String>,
    declared_consumers: HashSet<String>,
}

struct ProducerSlot {
    tx: mpsc::Sender<BrokerMessage>,
    buffer: Arc<tokio::sync::Mutex<ProducerBuffer>>,
}

/// Local side of a producer. Held exclusively by the attached dispatcher.
struct ProducerBuffer {
    rx: mpsc::Receiver<BrokerMessage>,
    /// A message whose publish failed; it goes out before anything in `rx`.
    head: Option<BrokerMessage>,
}

#[derive(Default)]
struct ConsumerQueue {
    routes: HashMap<String, Route>,
}

struct Route {
    tx: mpsc::Sender<BrokerMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BrokerMessage>>>,
}

/// What happened to a delivery handed to [`Inner::route`].
enum Routed {
    Delivered,
    /// The queue's default channel is full. Carries the message back with
    /// a sender to wait on.
    Backlogged(BrokerMessage, mpsc::Sender<BrokerMessage>),
    /// A correlation-keyed sub-channel exists but is full.
    Full,
    /// No sub-channel wants this correlation id.
    Unroutable,
}

impl Multiplexer {
    /// Create the multiplexer and start its connection task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(broker: Arc<dyn Broker>, config: MuxConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            broker,
            config,
            registry: Mutex::new(Registry::default()),
            state,
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        inner
            .tracker
            .spawn(session::run_connection(Arc::clone(&inner)));
        Self { inner }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Send handle for queue `name`. Memoized: every call for the same name
    /// feeds the same buffer.
    pub fn register_producer(&self, name: &str) -> Producer {
        let mut registry = self.inner.registry();
        let tx = match registry.producers.get(name) {
            Some(slot) => slot.tx.clone(),
            None => {
                let (tx, rx) = mpsc::channel(self.inner.config.buffer_capacity.max(1));
                registry.producers.insert(
                    name.to_string(),
                    ProducerSlot {
                        tx: tx.clone(),
                        buffer: Arc::new(tokio::sync::Mutex::new(ProducerBuffer {
                            rx,
                            head: None,
                        })),
                    },
                );
                debug!(queue = name, "producer registered");
                self.inner.wake.notify_one();
                tx
            }
        };
        Producer {
            queue: name.to_string(),
            tx,
            shutdown: self.inner.shutdown.clone(),
        }
    }

    /// Receive handle for the default correlation key of queue `name`.
    /// All handles for the same queue compete for one channel.
    pub fn register_consumer(&self, name: &str) -> Consumer {
        self.consumer(name, DEFAULT_KEY, self.inner.config.prefetch)
    }

    /// Receive handle scoped to `correlation_id` within queue `name`.
    pub fn register_response_consumer(&self, name: &str, correlation_id: &str) -> Consumer {
        self.consumer(name, correlation_id, self.inner.config.response_capacity)
    }

    /// Drop the sub-channel for `correlation_id`. Later deliveries for it are
    /// negatively acknowledged.
    pub fn close_response_consumer(&self, name: &str, correlation_id: &str) {
        let mut registry = self.inner.registry();
        if let Some(queue) = registry.consumers.get_mut(name)
            && queue.routes.remove(correlation_id).is_some()
        {
            debug!(queue = name, correlation_id, "response consumer closed");
        }
    }

    /// Stop consuming queue `name` here and send the default consumer's
    /// pending messages back to the broker so competing consumers get
    /// them. Those messages were acknowledged when they were routed, so
    /// without this they would be lost. Call once every reader has stopped
    /// and before [`Multiplexer::shutdown`]. Returns how many were sent.
    pub async fn release_consumer(&self, name: &str) -> Result<usize> {
        let route = {
            let mut registry = self.inner.registry();
            let Some(queue) = registry.consumers.get_mut(name) else {
                return Ok(0);
            };
            let route = queue.routes.remove(DEFAULT_KEY);
            if queue.routes.is_empty() {
                registry.consumers.remove(name);
                registry.declared_consumers.remove(name);
            }
            route
        };
        let Some(Route { tx, rx }) = route else {
            return Ok(0);
        };
        drop(tx);

        let mut pending = Vec::new();
        {
            let mut rx = rx.lock().await;
            while let Ok(msg) = rx.try_recv() {
                pending.push(msg);
            }
        }
        if pending.is_empty() {
            return Ok(0);
        }

        let producer = self.register_producer(name);
        let now = chrono::Utc::now();
        let mut sent = 0;
        for msg in &pending {
            let Some(msg) = msg.resend(now) else {
                continue;
            };
            producer.publish(msg).await?;
            sent += 1;
        }
        debug!(queue = name, sent, "pending messages returned to broker");
        Ok(sent)
    }

    /// Number of live sub-channels on queue `name`.
    pub fn route_count(&self, name: &str) -> usize {
        self.inner
            .registry()
            .consumers
            .get(name)
            .map_or(0, |q| q.routes.len())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Resolve once the physical connection is up.
    pub async fn wait_connected(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Connected).await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop consuming, let producers flush what they hold, and wait for all
    /// background tasks, at most `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        info!("multiplexer shutting down");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "multiplexer shutdown grace period elapsed with work in flight"
            );
        }
    }

    fn consumer(&self, name: &str, correlation_id: &str, capacity: usize) -> Consumer {
        let mut registry = self.inner.registry();
        let new_queue = !registry.consumers.contains_key(name);
        let queue = registry.consumers.entry(name.to_string()).or_default();
        let rx = match queue.routes.get(correlation_id) {
            Some(route) => Arc::clone(&route.rx),
            None => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let rx = Arc::new(tokio::sync::Mutex::new(rx));
                queue.routes.insert(
                    correlation_id.to_string(),
                    Route {
                        tx,
                        rx: Arc::clone(&rx),
                    },
                );
                rx
            }
        };
        if new_queue {
            debug!(queue = name, "consumer registered");
            self.inner.wake.notify_one();
        }
        Consumer {
            queue: name.to_string(),
            correlation_id: correlation_id.to_string(),
            rx,
            shutdown: self.inner.shutdown.clone(),
        }
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Queues registered but not yet declared on the current connection.
    fn undeclared(&self) -> (Vec<(String, Arc<tokio::sync::Mutex<ProducerBuffer>>)>, Vec<String>) {
        let registry = self.registry();
        let producers = registry
            .producers
            .iter()
            .filter(|(name, _)| !registry.declared_producers.contains(*name))
            .map(|(name, slot)| (name.clone(), Arc::clone(&slot.buffer)))
            .collect();
        let consumers = registry
            .consumers
            .keys()
            .filter(|name| !registry.declared_consumers.contains(*name))
            .cloned()
            .collect();
        (producers, consumers)
    }

    fn mark_producer_declared(&self, name: &str) {
        self.registry().declared_producers.insert(name.to_string());
    }

    fn mark_consumer_declared(&self, name: &str) {
        self.registry().declared_consumers.insert(name.to_string());
    }

    /// Detach a producer so the next declare pass attaches a fresh dispatcher.
    fn forget_producer(&self, name: &str) {
        self.registry().declared_producers.remove(name);
    }

    fn forget_consumer(&self, name: &str) {
        self.registry().declared_consumers.remove(name);
    }

    /// Connection lost: everything must be declared again.
    fn forget_declared(&self) {
        let mut registry = self.registry();
        registry.declared_producers.clear();
        registry.declared_consumers.clear();
    }

    /// Is anything in this process still consuming `queue`?
    fn is_consumed(&self, queue: &str) -> bool {
        self.registry().consumers.contains_key(queue)
    }

    /// Hand a delivery to the sub-channel for its correlation id, falling
    /// back to the queue's default consumer.
    fn route(&self, queue: &str, msg: BrokerMessage) -> Routed {
        let registry = self.registry();
        let Some(consumers) = registry.consumers.get(queue) else {
            return Routed::Unroutable;
        };
        let (route, is_default) = match consumers.routes.get(&msg.correlation_id) {
            Some(route) => (Some(route), msg.correlation_id == DEFAULT_KEY),
            None => (consumers.routes.get(DEFAULT_KEY), true),
        };
        let Some(route) = route else {
            return Routed::Unroutable;
        };
        match route.tx.try_send(msg) {
            Ok(()) => Routed::Delivered,
            Err(mpsc::error::TrySendError::Full(msg)) if is_default => {
                Routed::Backlogged(msg, route.tx.clone())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Routed::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Routed::Unroutable,
        }
    }
}

/// Send side of a logical queue.
#[derive(Clone, Debug)]
pub struct Producer {
    queue: String,
    tx: mpsc::Sender<BrokerMessage>,
    shutdown: CancellationToken,
}

impl Producer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Buffer `msg` for publishing. Waits while the local buffer is full,
    /// whether or not the broker is reachable.
    pub async fn publish(&self, msg: BrokerMessage) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed(self.queue.clone()));
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Closed(self.queue.clone())),
            sent = self.tx.send(msg) => sent.map_err(|_| Error::Closed(self.queue.clone())),
        }
    }

    /// Buffer `msg` without waiting. Returns `false` if the buffer is full
    /// and the message was not taken.
    pub fn try_publish(&self, msg: BrokerMessage) -> Result<bool> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed(self.queue.clone()));
        }
        match self.tx.try_send(msg) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Closed(self.queue.clone())),
        }
    }
}

/// Receive side of a logical queue (or of one correlation id within it).
#[derive(Clone)]
pub struct Consumer {
    queue: String,
    correlation_id: String,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BrokerMessage>>>,
    shutdown: CancellationToken,
}

impl Consumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the next message. `None` once the multiplexer shuts down or
    /// the sub-channel has been closed and drained.
    pub async fn recv(&self) -> Option<BrokerMessage> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    /// Take a message if one is ready.
    pub fn try_recv(&self) -> Option<BrokerMessage> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn mux() -> (MemoryBroker, Multiplexer) {
        let broker = MemoryBroker::new();
        let mux = Multiplexer::start(
            Arc::new(broker.clone()),
            MuxConfig {
                reconnect_delay: Duration::from_millis(20),
                declare_interval: Duration::from_millis(20),
                receive_wait: Duration::from_millis(50),
                redelivery_backoff: Duration::from_millis(5),
                ..MuxConfig::default()
            },
        );
        (broker, mux)
    }

    #[tokio::test]
    async fn producer_registration_is_memoized() {
        let (_, mux) = mux();
        let a = mux.register_producer("q");
        let b = mux.register_producer("q");
        assert!(a.tx.same_channel(&b.tx));
    }

    #[tokio::test]
    async fn consumer_registration_is_idempotent_per_key() {
        let (_, mux) = mux();
        let a = mux.register_response_consumer("q", "k1");
        let b = mux.register_response_consumer("q", "k1");
        let c = mux.register_response_consumer("q", "k2");
        assert!(Arc::ptr_eq(&a.rx, &b.rx));
        assert!(!Arc::ptr_eq(&a.rx, &c.rx));
        assert_eq!(mux.route_count("q"), 2);

        mux.close_response_consumer("q", "k1");
        assert_eq!(mux.route_count("q"), 1);
        // closing twice is harmless
        mux.close_response_consumer("q", "k1");
        assert_eq!(mux.route_count("q"), 1);
    }

    #[tokio::test]
    async fn routing_prefers_exact_key_then_default() {
        let (_, mux) = mux();
        let default = mux.register_consumer("q");
        let keyed = mux.register_response_consumer("q", "abc");

        let routed = mux.inner.route("q", BrokerMessage::new("abc", vec![1]));
        assert!(matches!(routed, Routed::Delivered));
        let routed = mux.inner.route("q", BrokerMessage::new("other", vec![2]));
        assert!(matches!(routed, Routed::Delivered));

        assert_eq!(keyed.try_recv().unwrap().payload, vec![1]);
        assert_eq!(default.try_recv().unwrap().correlation_id, "other");
    }

    #[tokio::test]
    async fn unknown_key_without_default_is_unroutable() {
        let (_, mux) = mux();
        let _keyed = mux.register_response_consumer("q", "abc");
        let routed = mux.inner.route("q", BrokerMessage::new("zzz", vec![]));
        assert!(matches!(routed, Routed::Unroutable));
        let routed = mux.inner.route("nope", BrokerMessage::new("", vec![]));
        assert!(matches!(routed, Routed::Unroutable));
    }

    #[tokio::test]
    async fn full_sub_channel_is_reported() {
        let (_, mux) = mux();
        let _keyed = mux.register_response_consumer("q", "k");
        let capacity = mux.config().response_capacity;
        for _ in 0..capacity {
            assert!(matches!(
                mux.inner.route("q", BrokerMessage::new("k", vec![])),
                Routed::Delivered
            ));
        }
        assert!(matches!(
            mux.inner.route("q", BrokerMessage::new("k", vec![])),
            Routed::Full
        ));
    }

    #[tokio::test]
    async fn full_default_channel_hands_the_message_back() {
        let (_, mux) = mux();
        let default = mux.register_consumer("q");
        for _ in 0..mux.config().prefetch {
            assert!(matches!(
                mux.inner.route("q", BrokerMessage::new("t1", vec![])),
                Routed::Delivered
            ));
        }
        match mux.inner.route("q", BrokerMessage::new("t2", vec![9])) {
            Routed::Backlogged(msg, tx) => {
                assert_eq!(msg.payload, vec![9]);
                assert!(default.try_recv().is_some());
                assert!(tx.try_reserve().is_ok());
            }
            _ => panic!("expected the message back"),
        }
    }

    #[tokio::test]
    async fn release_returns_pending_messages_and_stops_routing() {
        let (broker, mux) = mux();
        let consumer = mux.register_consumer("work");
        mux.wait_connected().await;
        assert!(matches!(
            mux.inner.route("work", BrokerMessage::new("a", vec![1])),
            Routed::Delivered
        ));

        assert_eq!(mux.release_consumer("work").await.unwrap(), 1);
        assert_eq!(mux.route_count("work"), 0);
        assert!(consumer.try_recv().is_none());
        assert!(matches!(
            mux.inner.route("work", BrokerMessage::new("b", vec![2])),
            Routed::Unroutable
        ));
        assert_eq!(mux.release_consumer("work").await.unwrap(), 0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.depth("work") < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("released message republished");
    }

    #[tokio::test]
    async fn publish_after_shutdown_is_closed() {
        let (_, mux) = mux();
        let producer = mux.register_producer("q");
        mux.shutdown(Duration::from_millis(200)).await;
        let err = producer
            .publish(BrokerMessage::new("", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        assert!(mux.is_shutdown());
    }

    #[tokio::test]
    async fn connects_and_declares_registered_queues() {
        let (broker, mux) = mux();
        mux.wait_connected().await;
        let _p = mux.register_producer("out");
        let _c = mux.register_consumer("in");

        tokio::time::timeout(Duration::from_secs(2), async {
            while !(broker.has_queue("out") && broker.has_queue("in")) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queues declared");
        assert_eq!(mux.state(), ConnectionState::Connected);
    }
}
