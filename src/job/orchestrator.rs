//! Sequential pipeline execution for one job.

use crate::eval::Evaluator;
use crate::event::{EventPublisher, Level, Status};
use crate::model::{Job, JobRef, PipelineTask};
use crate::rpc::{NewTaskRequest, RetryPolicy, TaskClient};
use crate::rpc::client::DEFAULT_TIMEOUT;
use crate::telemetry::{metrics, spans};
use opentelemetry::KeyValue;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span, debug, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Used for tasks that do not set `timeout_secs`.
    pub default_timeout: Duration,
    /// Applied to every task call.
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::none(),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed {
        stage: String,
        task: String,
        error: String,
    },
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

enum TaskStep {
    Done,
    Skipped,
    Failed(String),
}

pub struct Orchestrator {
    tasks: TaskClient,
    events: EventPublisher,
    evaluator: Arc<dyn Evaluator>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        tasks: TaskClient,
        events: EventPublisher,
        evaluator: Arc<dyn Evaluator>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            tasks,
            events,
            evaluator,
            config,
        }
    }

    /// Run every stage of `job` in order, one task at a time.
    ///
    /// A failing task aborts the job unless it sets `ignore_errors`.
    pub async fn run(&self, job: &Job) -> JobOutcome {
        let span = spans::start_job_span(&job.id.to_string(), &job.name);
        async {
            let span = Span::current();
            spans::record_status(&span, "job.status", "pending", "running");
            self.events.status(job.id, None, Status::Running);

            let outcome = self.run_stages(job).await;

            let result = match &outcome {
                JobOutcome::Completed => {
                    self.events.status(job.id, None, Status::Completed);
                    info!(job_id = %job.id, job = %job.name, "job completed");
                    "completed"
                }
                JobOutcome::Failed { stage, task, error } => {
                    self.events.failure(job.id, None, error.clone());
                    warn!(job_id = %job.id, job = %job.name, %stage, %task, %error, "job failed");
                    "failed"
                }
            };
            spans::record_status(&span, "job.status", "running", result);
            metrics::jobs_finished().add(1, &[KeyValue::new("result", result)]);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_stages(&self, job: &Job) -> JobOutcome {
        let mut vars = job.parameters.clone();
        let mut task_index = 0;

        for stage in &job.pipeline.stages {
            debug!(job_id = %job.id, stage = %stage.name, "stage started");
            for task in &stage.tasks {
                let index = task_index;
                task_index += 1;

                match self.run_task(job, index, task, &mut vars).await {
                    TaskStep::Done | TaskStep::Skipped => {}
                    TaskStep::Failed(error) if task.ignore_errors => {
                        warn!(job_id = %job.id, task = %task.name, %error, "task failed, errors ignored");
                    }
                    TaskStep::Failed(error) => {
                        return JobOutcome::Failed {
                            stage: stage.name.clone(),
                            task: task.name.clone(),
                            error,
                        };
                    }
                }
            }
        }
        JobOutcome::Completed
    }

    async fn run_task(
        &self,
        job: &Job,
        index: usize,
        task: &PipelineTask,
        vars: &mut crate::model::Output,
    ) -> TaskStep {
        if let Some(guard) = &task.when {
            match self.evaluator.evaluate(guard, vars) {
                Ok(value) if value == "true" => {}
                Ok(value) => {
                    debug!(job_id = %job.id, task = %task.name, %guard, %value, "guard not met, skipping");
                    self.events.status(job.id, Some(index), Status::Skipped);
                    return TaskStep::Skipped;
                }
                Err(e) => {
                    let error = format!("guard '{guard}': {e}");
                    self.events.failure(job.id, Some(index), error.clone());
                    return TaskStep::Failed(error);
                }
            }
        }

        let parameters = match self.evaluator.render(&task.parameters, vars) {
            Ok(parameters) => parameters,
            Err(e) => {
                let error = format!("parameters: {e}");
                self.events.failure(job.id, Some(index), error.clone());
                return TaskStep::Failed(error);
            }
        };

        self.events.status(job.id, Some(index), Status::Running);
        let request = NewTaskRequest::new(&task.service, &task.name)
            .parameters(parameters)
            .timeout(task.timeout().unwrap_or(self.config.default_timeout))
            .job(JobRef {
                job_id: job.id,
                task_index: index,
            });

        match self.tasks.call(request, self.config.retry).await {
            Ok(output) => {
                self.events.status(job.id, Some(index), Status::Succeeded);
                if let Some(name) = &task.register {
                    let value = Value::Object(output);
                    self.events.variable(job.id, Some(index), name.clone(), value.clone());
                    vars.insert(name.clone(), value);
                }
                if let Some(text) = &task.notify {
                    self.events.message(job.id, Some(index), Level::Info, text.clone());
                }
                TaskStep::Done
            }
            Err(e) => {
                let error = e.to_string();
                self.events.failure(job.id, Some(index), error.clone());
                TaskStep::Failed(error)
            }
        }
    }
}
