//! Service side: C consumer loops on a service's request queue.

use crate::broker::BrokerMessage;
use crate::error::Result;
use crate::model::{TaskRequest, TaskResult};
use crate::mux::{Consumer, Multiplexer, Producer};
use crate::queues;
use crate::telemetry::metrics;
use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Turns one request into its result. Failures are expressed through
/// [`TaskResult::error`], never by withholding a reply.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: TaskRequest) -> TaskResult;
}

/// Serves one named service with a fixed number of consumer loops.
pub struct RpcServer {
    mux: Multiplexer,
    service: String,
    handler: Arc<dyn RequestHandler>,
    concurrency: usize,
}

impl RpcServer {
    pub fn new(
        mux: Multiplexer,
        service: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
        concurrency: usize,
    ) -> Self {
        Self {
            mux,
            service: service.into(),
            handler,
            concurrency: concurrency.max(1),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Run until `shutdown` is cancelled. In-flight handlers finish and
    /// publish their results before this returns; requests received but
    /// not started go back to the broker for other workers.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let request_queue = queues::task_request(&self.service);
        let requests = self.mux.register_consumer(&request_queue);
        let results = self
            .mux
            .register_producer(&queues::task_result(&self.service));

        info!(
            service = %self.service,
            concurrency = self.concurrency,
            "task service started"
        );

        let tracker = TaskTracker::new();
        for slot in 0..self.concurrency {
            tracker.spawn(serve_loop(
                slot,
                self.service.clone(),
                requests.clone(),
                results.clone(),
                Arc::clone(&self.handler),
                shutdown.clone(),
            ));
        }
        tracker.close();
        tracker.wait().await;

        match self.mux.release_consumer(&request_queue).await {
            Ok(0) => {}
            Ok(returned) => info!(service = %self.service, returned, "unstarted requests returned"),
            Err(e) => warn!(service = %self.service, error = %e, "unstarted requests lost"),
        }
        info!(service = %self.service, "task service stopped");
        Ok(())
    }
}

/// One consumer loop. Handles its requests strictly one at a time; a slow
/// handler only occupies this slot.
async fn serve_loop(
    slot: usize,
    service: String,
    requests: Consumer,
    results: Producer,
    handler: Arc<dyn RequestHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            msg = requests.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let request: TaskRequest = match msg.decode_payload() {
            Ok(request) => request,
            Err(e) => {
                warn!(%service, slot, error = %e, "dropping malformed task request");
                continue;
            }
        };
        if msg.is_expired_at(Utc::now()) {
            debug!(%service, slot, task_id = %request.task_id, "skipping expired task request");
            metrics::deliveries_dropped().add(1, &[KeyValue::new("reason", "expired")]);
            continue;
        }
        debug!(%service, slot, task_id = %request.task_id, "task request received");

        let result = handler.handle(request).await;

        let reply = match BrokerMessage::json(msg.correlation_id.clone(), &result) {
            Ok(reply) => match msg.expiration {
                Some(expiration) => reply.with_expiration(expiration),
                None => reply,
            },
            Err(e) => {
                error!(%service, slot, error = %e, "cannot encode task result");
                continue;
            }
        };
        if let Err(e) = results.publish(reply).await {
            warn!(%service, slot, error = %e, "result not published, stopping");
            break;
        }
    }
    debug!(%service, slot, "consumer loop stopped");
}
