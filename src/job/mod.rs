//! Job submission and execution.
//!
//! Jobs are fire-and-forget: [`JobClient::submit`] publishes on the shared
//! job queue and returns. Job workers compete for the queue and drive each
//! pipeline through the [`Orchestrator`]; progress is visible only through
//! events.

pub mod orchestrator;
pub mod worker;

pub use orchestrator::{JobOutcome, Orchestrator, OrchestratorConfig};
pub use worker::{JobPoolConfig, JobWorkerPool};

use crate::broker::BrokerMessage;
use crate::error::Result;
use crate::model::{Job, JobId, JobRequest};
use crate::mux::{Multiplexer, Producer};
use crate::queues;
use tracing::info;

#[derive(Clone)]
pub struct JobClient {
    jobs: Producer,
}

impl JobClient {
    pub fn new(mux: &Multiplexer) -> Self {
        Self {
            jobs: mux.register_producer(queues::JOB),
        }
    }

    /// Publish `job` for execution by some job worker. Waits only if the job
    /// queue's local buffer is full.
    pub async fn submit(&self, job: Job) -> Result<JobId> {
        let job_id = job.id;
        let name = job.name.clone();
        let tasks = job.pipeline.task_count();
        let msg = BrokerMessage::json(job_id.to_string(), &JobRequest { job })?;
        self.jobs.publish(msg).await?;
        info!(%job_id, job = %name, tasks, "job submitted");
        Ok(job_id)
    }
}
