//! Task worker pools: a named service backed by a [`TaskHandler`].
//!
//! The pool runs an [`RpcServer`] with C consumer loops. Each request gets
//! a fresh [`TaskContext`] from the pool's [`ContextFactory`]; the context's
//! working directory is flushed and released after the handler returns,
//! whatever the outcome.

use crate::error::Result;
use crate::model::{Output, TaskRequest, TaskResult};
use crate::mux::Multiplexer;
use crate::rpc::{RequestHandler, RpcServer};
use crate::sandbox::{ContextFactory, Environment, Filesystem};
use crate::telemetry::{metrics, spans};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, warn};

// ---------------------------------------------------------------------------
// Handler seam
// ---------------------------------------------------------------------------

/// Everything a handler may use while serving one request.
pub struct TaskContext {
    pub request: TaskRequest,
    pub fs: Box<dyn Filesystem>,
    pub env: Box<dyn Environment>,
}

impl TaskContext {
    pub fn parameters(&self) -> &Output {
        &self.request.parameters
    }
}

/// Service-specific work. An `Err` becomes the task's error string.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn run(&self, ctx: &mut TaskContext) -> anyhow::Result<Output>;
}

/// Adapts an async function of the request into a [`TaskHandler`], for
/// services that need neither files nor processes.
pub struct FnHandler<F, Fut> {
    op: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Output>> + Send + 'static,
{
    pub fn new(op: F) -> Self {
        Self {
            op,
            _fut: PhantomData,
        }
    }
}

impl<F, Fut> From<F> for FnHandler<F, Fut>
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Output>> + Send + 'static,
{
    fn from(op: F) -> Self {
        Self::new(op)
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F, Fut>
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Output>> + Send + 'static,
{
    async fn run(&self, ctx: &mut TaskContext) -> anyhow::Result<Output> {
        (self.op)(ctx.request.clone()).await
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TaskPoolConfig {
    /// Number of independent consumer loops.
    pub concurrency: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

pub struct TaskWorkerPool {
    server: RpcServer,
}

impl TaskWorkerPool {
    pub fn new(
        mux: Multiplexer,
        service: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        contexts: Arc<dyn ContextFactory>,
        config: TaskPoolConfig,
    ) -> Self {
        let service = service.into();
        let adapter = SandboxedHandler {
            service: service.clone(),
            handler,
            contexts,
        };
        Self {
            server: RpcServer::new(mux, service, Arc::new(adapter), config.concurrency),
        }
    }

    pub fn service(&self) -> &str {
        self.server.service()
    }

    /// Serve until `shutdown` is cancelled and in-flight tasks finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.server.run(shutdown).await
    }
}

struct SandboxedHandler {
    service: String,
    handler: Arc<dyn TaskHandler>,
    contexts: Arc<dyn ContextFactory>,
}

impl SandboxedHandler {
    async fn invoke(&self, request: TaskRequest) -> anyhow::Result<Output> {
        let (fs, env) = self.contexts.create(&request).await?;
        let mut ctx = TaskContext { request, fs, env };

        let mut outcome = self.handler.run(&mut ctx).await;
        if outcome.is_ok()
            && let Err(e) = ctx.fs.flush().await
        {
            outcome = Err(anyhow::Error::from(e).context("flushing task outputs"));
        }
        if let Err(e) = ctx.fs.close().await {
            warn!(service = %self.service, error = %e, "task working directory not released");
        }
        outcome
    }
}

#[async_trait]
impl RequestHandler for SandboxedHandler {
    async fn handle(&self, request: TaskRequest) -> TaskResult {
        let task_id = request.task_id.to_string();
        let span = spans::start_task_span(&self.service, &task_id, &request.name);
        let started = Instant::now();

        async {
            let current = tracing::Span::current();
            spans::record_status(&current, "task.status", "pending", "running");

            let (result, status) = match self.invoke(request).await {
                Ok(output) => (TaskResult::ok(output), "succeeded"),
                Err(e) => {
                    warn!(service = %self.service, %task_id, error = %e, "task failed");
                    (TaskResult::failed(format!("{e:#}")), "failed")
                }
            };
            spans::record_status(&current, "task.status", "running", status);

            metrics::task_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[
                    KeyValue::new("service", self.service.clone()),
                    KeyValue::new("result", status),
                ],
            );
            result
        }
        .instrument(span)
        .await
    }
}
