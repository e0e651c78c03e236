//! Job worker pool: N loops competing on the shared job queue.

use super::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::error::Result;
use crate::eval::Evaluator;
use crate::event::EventPublisher;
use crate::model::JobRequest;
use crate::mux::{Consumer, Multiplexer};
use crate::queues;
use crate::rpc::{RetryPolicy, TaskClient};
use crate::rpc::client::DEFAULT_TIMEOUT;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct JobPoolConfig {
    /// Jobs executed at once by this pool.
    pub concurrency: usize,
    /// Timeout for tasks that do not set their own.
    pub task_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for JobPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            task_timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::none(),
        }
    }
}

pub struct JobWorkerPool {
    mux: Multiplexer,
    orchestrator: Arc<Orchestrator>,
    concurrency: usize,
    active_jobs: Arc<AtomicUsize>,
}

impl JobWorkerPool {
    pub fn new(mux: Multiplexer, evaluator: Arc<dyn Evaluator>, config: JobPoolConfig) -> Self {
        let orchestrator = Orchestrator::new(
            TaskClient::new(mux.clone()),
            EventPublisher::new(&mux),
            evaluator,
            OrchestratorConfig {
                default_timeout: config.task_timeout,
                retry: config.retry,
            },
        );
        Self {
            mux,
            orchestrator: Arc::new(orchestrator),
            concurrency: config.concurrency.max(1),
            active_jobs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Jobs currently being executed.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::Relaxed)
    }

    /// Consume jobs until `shutdown` is cancelled. Jobs already running are
    /// finished before this returns; jobs received but not started go back
    /// to the broker for other workers.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let jobs = self.mux.register_consumer(queues::JOB);
        info!(concurrency = self.concurrency, "job worker pool started");

        let tracker = TaskTracker::new();
        for slot in 0..self.concurrency {
            tracker.spawn(job_loop(
                slot,
                jobs.clone(),
                Arc::clone(&self.orchestrator),
                Arc::clone(&self.active_jobs),
                shutdown.clone(),
            ));
        }
        tracker.close();
        tracker.wait().await;

        match self.mux.release_consumer(queues::JOB).await {
            Ok(0) => {}
            Ok(returned) => info!(returned, "unstarted jobs returned"),
            Err(e) => warn!(error = %e, "unstarted jobs lost"),
        }
        info!("job worker pool stopped");
        Ok(())
    }
}

async fn job_loop(
    slot: usize,
    jobs: Consumer,
    orchestrator: Arc<Orchestrator>,
    active_jobs: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            msg = jobs.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let request: JobRequest = match msg.decode_payload() {
            Ok(request) => request,
            Err(e) => {
                warn!(slot, error = %e, "dropping malformed job request");
                continue;
            }
        };
        let job = request.job;
        info!(slot, job_id = %job.id, job = %job.name, "job received");

        active_jobs.fetch_add(1, Ordering::Relaxed);
        let outcome = orchestrator.run(&job).await;
        active_jobs.fetch_sub(1, Ordering::Relaxed);

        debug!(slot, job_id = %job.id, completed = outcome.is_completed(), "job finished");
    }
    debug!(slot, "job loop stopped");
}
