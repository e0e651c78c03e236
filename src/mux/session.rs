//! Connection lifecycle and per-queue dispatchers.
//!
//! `run_connection` drives Disconnected → Connecting → Connected. Each
//! successful connect opens a session; a session ends when any dispatcher
//! hits a connectivity error or the liveness check fails. Dispatchers are
//! tied to the session that spawned them.

use super::{ConnectionState, Inner, ProducerBuffer, Routed};
use crate::broker::{BrokerMessage, Connection, Delivery};
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(super) async fn run_connection(inner: Arc<Inner>) {
    loop {
        inner.set_state(ConnectionState::Connecting);
        let Some(conn) = connect_with_retry(&inner).await else {
            break;
        };
        inner.set_state(ConnectionState::Connected);
        info!("broker connected");

        let session = CancellationToken::new();
        let lost = manage_session(&inner, &conn, &session).await;
        if !lost {
            // Shutdown: producers keep this session to flush their buffers.
            break;
        }

        session.cancel();
        inner.forget_declared();
        inner.set_state(ConnectionState::Disconnected);
        metrics::reconnects().add(1, &[]);
        warn!("broker connection lost, reconnecting");
    }
    inner.set_state(ConnectionState::Disconnected);
    debug!("connection task stopped");
}

/// Connect with a fixed delay between attempts. `None` on shutdown.
async fn connect_with_retry(inner: &Arc<Inner>) -> Option<Arc<dyn Connection>> {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return None,
            attempt = inner.broker.connect() => match attempt {
                Ok(conn) => return Some(conn),
                Err(e) => warn!(error = %e, "broker connect failed"),
            },
        }
        inner.set_state(ConnectionState::Disconnected);
        tokio::select! {
            _ = inner.shutdown.cancelled() => return None,
            _ = tokio::time::sleep(inner.config.reconnect_delay) => {}
        }
        inner.set_state(ConnectionState::Connecting);
    }
}

/// Keep queues declared and dispatchers attached. Returns `true` when the
/// connection was lost, `false` on shutdown.
async fn manage_session(
    inner: &Arc<Inner>,
    conn: &Arc<dyn Connection>,
    session: &CancellationToken,
) -> bool {
    let mut tick = tokio::time::interval(inner.config.declare_interval);
    loop {
        if let Err(e) = declare_pass(inner, conn, session).await {
            warn!(error = %e, "declare pass failed");
            return true;
        }
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                // Attach dispatchers to producers registered since the last
                // pass so their buffers are flushed too.
                if let Err(e) = declare_pass(inner, conn, session).await {
                    warn!(error = %e, "final declare pass failed");
                }
                return false;
            }
            _ = session.cancelled() => return true,
            _ = inner.wake.notified() => {}
            _ = tick.tick() => {
                if !conn.is_open() {
                    return true;
                }
            }
        }
    }
}

/// Declare every registered queue not yet declared on this connection and
/// attach a dispatcher to it.
async fn declare_pass(
    inner: &Arc<Inner>,
    conn: &Arc<dyn Connection>,
    session: &CancellationToken,
) -> Result<()> {
    let (producers, consumers) = inner.undeclared();

    for (name, buffer) in producers {
        if !declare(conn, &name).await? {
            continue;
        }
        inner.mark_producer_declared(&name);
        inner.tracker.spawn(producer_dispatcher(
            Arc::clone(inner),
            Arc::clone(conn),
            session.clone(),
            name,
            buffer,
        ));
    }

    for name in consumers {
        if !declare(conn, &name).await? {
            continue;
        }
        inner.mark_consumer_declared(&name);
        inner.tracker.spawn(consumer_dispatcher(
            Arc::clone(inner),
            Arc::clone(conn),
            session.clone(),
            name,
        ));
    }
    Ok(())
}

/// `Ok(false)` when the broker refused the declare; it is retried on the
/// next pass. Connectivity errors end the session.
async fn declare(conn: &Arc<dyn Connection>, name: &str) -> Result<bool> {
    match conn.declare(name).await {
        Ok(()) => {
            debug!(queue = name, "queue declared");
            Ok(true)
        }
        Err(e @ Error::Connectivity(_)) => Err(e),
        Err(e) => {
            warn!(queue = name, error = %e, "queue declare rejected");
            Ok(false)
        }
    }
}

/// Drain one producer buffer onto the broker, preserving order.
async fn producer_dispatcher(
    inner: Arc<Inner>,
    conn: Arc<dyn Connection>,
    session: CancellationToken,
    name: String,
    buffer: Arc<tokio::sync::Mutex<ProducerBuffer>>,
) {
    let mut buffer = buffer.lock().await;
    loop {
        let msg = match buffer.head.take() {
            Some(msg) => msg,
            None => {
                tokio::select! {
                    biased;
                    _ = session.cancelled() => return,
                    msg = buffer.rx.recv() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                    // Buffer is empty and nothing new may arrive.
                    _ = inner.shutdown.cancelled() => return,
                }
            }
        };

        let body = match msg.encode() {
            Ok(body) => body,
            Err(e) => {
                error!(queue = %name, error = %e, "dropping unencodable message");
                continue;
            }
        };

        if let Err(e) = conn.publish(&name, &body).await {
            warn!(queue = %name, error = %e, "publish failed, message re-enqueued");
            buffer.head = Some(msg);
            if matches!(e, Error::Connectivity(_)) {
                session.cancel();
            } else if !session.is_cancelled() {
                inner.forget_producer(&name);
            }
            return;
        }
        metrics::messages_published().add(1, &[KeyValue::new("queue", name.clone())]);
    }
}

/// Receive deliveries for one queue and route them by correlation id.
async fn consumer_dispatcher(
    inner: Arc<Inner>,
    conn: Arc<dyn Connection>,
    session: CancellationToken,
    name: String,
) {
    loop {
        if !inner.is_consumed(&name) {
            debug!(queue = %name, "queue released, consumer dispatcher stopped");
            return;
        }
        let received = tokio::select! {
            _ = session.cancelled() => return,
            _ = inner.shutdown.cancelled() => return,
            received = conn.receive(&name, inner.config.receive_wait) => received,
        };
        let outcome = match received {
            Ok(Some(delivery)) => dispatch(&inner, conn.as_ref(), &session, &name, delivery).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            warn!(queue = %name, error = %e, "consumer dispatcher stopped");
            if matches!(e, Error::Connectivity(_)) {
                session.cancel();
            } else if !session.is_cancelled() {
                inner.forget_consumer(&name);
            }
            return;
        }
    }
}

async fn dispatch(
    inner: &Inner,
    conn: &dyn Connection,
    session: &CancellationToken,
    queue: &str,
    delivery: Delivery,
) -> Result<()> {
    let mut msg = match BrokerMessage::decode(&delivery.body) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(queue, error = %e, "dropping malformed delivery");
            return conn.nack(queue, delivery.tag, false).await;
        }
    };

    msg.set_enqueued_at(delivery.enqueued_at);
    if msg.is_expired_at(chrono::Utc::now()) {
        debug!(queue, correlation_id = %msg.correlation_id, "dropping expired delivery");
        metrics::deliveries_dropped().add(1, &[KeyValue::new("reason", "expired")]);
        return conn.ack(queue, delivery.tag).await;
    }

    let correlation_id = msg.correlation_id.clone();
    let routed = match inner.route(queue, msg) {
        Routed::Backlogged(msg, tx) => hold(inner, session, queue, msg, tx).await,
        routed => routed,
    };
    match routed {
        Routed::Delivered => conn.ack(queue, delivery.tag).await,
        // A full channel has a local reader, so only unroutable
        // deliveries count toward the cap.
        Routed::Unroutable if delivery.redelivered >= inner.config.max_redeliveries => {
            debug!(queue, %correlation_id, "dropping delivery after repeated redelivery");
            metrics::deliveries_dropped().add(1, &[KeyValue::new("reason", "redelivered")]);
            conn.nack(queue, delivery.tag, false).await
        }
        Routed::Backlogged(..) | Routed::Full | Routed::Unroutable => {
            conn.nack(queue, delivery.tag, true).await?;
            tokio::time::sleep(inner.config.redelivery_backoff).await;
            Ok(())
        }
    }
}

/// Keep an unacknowledged delivery until the default channel has room,
/// at most `hold_timeout`. Routing is retried under the registry lock, so
/// a consumer released meanwhile sees the message as unroutable.
async fn hold(
    inner: &Inner,
    session: &CancellationToken,
    queue: &str,
    mut msg: BrokerMessage,
    mut tx: mpsc::Sender<BrokerMessage>,
) -> Routed {
    let deadline = tokio::time::Instant::now() + inner.config.hold_timeout;
    loop {
        let space = tokio::select! {
            permit = tx.reserve() => permit.is_ok(),
            _ = tokio::time::sleep_until(deadline) => false,
            _ = session.cancelled() => false,
            _ = inner.shutdown.cancelled() => false,
        };
        if !space {
            return Routed::Full;
        }
        match inner.route(queue, msg) {
            Routed::Backlogged(again, sender) => {
                msg = again;
                tx = sender;
            }
            routed => return routed,
        }
    }
}
