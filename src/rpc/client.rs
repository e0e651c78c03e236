//! Caller side: dispatch, timed wait, retry.

use crate::broker::BrokerMessage;
use crate::error::{Error, Result};
use crate::model::{JobRef, Output, TaskId, TaskRequest, TaskResult};
use crate::mux::{Consumer, Multiplexer};
use crate::queues;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default task timeout when the builder is not given one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Builder for a task call. The task id is assigned at dispatch time, so
/// one builder can be dispatched repeatedly.
#[derive(Debug, Clone)]
pub struct NewTaskRequest {
    service: String,
    name: String,
    parameters: Output,
    timeout: Duration,
    job_ref: Option<JobRef>,
}

impl NewTaskRequest {
    pub fn new(service: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            name: name.into(),
            parameters: Output::new(),
            timeout: DEFAULT_TIMEOUT,
            job_ref: None,
        }
    }

    pub fn parameters(mut self, parameters: Output) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn job(mut self, job_ref: JobRef) -> Self {
        self.job_ref = Some(job_ref);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

/// Bounded caller-side retry. Every attempt is a fresh dispatch with a new
/// task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Treated as at least 1.
    pub attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Issues task calls on behalf of one client.
#[derive(Clone)]
pub struct TaskClient {
    mux: Multiplexer,
}

impl TaskClient {
    pub fn new(mux: Multiplexer) -> Self {
        Self { mux }
    }

    /// Publish a request and return without waiting for its result.
    ///
    /// The response sub-channel is reserved before the request goes out so
    /// an early reply cannot be missed. Waits only if the request queue's
    /// local buffer is full.
    pub async fn dispatch(&self, new: NewTaskRequest) -> Result<DispatchedTask> {
        let deadline = Instant::now() + new.timeout;
        let request = TaskRequest {
            task_id: TaskId::new(),
            name: new.name,
            service: new.service,
            timeout: new.timeout,
            job_ref: new.job_ref,
            parameters: new.parameters,
        };
        let correlation_id = request.task_id.to_string();
        let result_queue = queues::task_result(&request.service);

        let consumer = self
            .mux
            .register_response_consumer(&result_queue, &correlation_id);
        let handle = DispatchedTask {
            request,
            result_queue,
            consumer,
            mux: self.mux.clone(),
            deadline,
            released: false,
        };

        let msg = BrokerMessage::json(correlation_id, &handle.request)?
            .with_expiration(handle.request.timeout);
        self.mux
            .register_producer(&queues::task_request(&handle.request.service))
            .publish(msg)
            .await?;

        metrics::tasks_dispatched().add(
            1,
            &[KeyValue::new("service", handle.request.service.clone())],
        );
        debug!(
            task_id = %handle.request.task_id,
            service = %handle.request.service,
            task = %handle.request.name,
            "task dispatched"
        );
        Ok(handle)
    }

    /// Dispatch and wait, retrying timeouts and task failures per `policy`.
    pub async fn call(&self, new: NewTaskRequest, policy: RetryPolicy) -> Result<Output> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = self.dispatch(new.clone()).await?.wait().await;
            match outcome {
                Err(e) if e.is_task_outcome() && attempt < attempts => {
                    warn!(
                        service = new.service(),
                        attempt,
                        attempts,
                        error = %e,
                        "task attempt failed, retrying"
                    );
                    tokio::time::sleep(policy.delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

/// A request in flight, bound to its reserved response sub-channel.
///
/// The sub-channel is released when [`wait`](Self::wait) returns or the
/// handle is dropped, whichever comes first.
pub struct DispatchedTask {
    request: TaskRequest,
    result_queue: String,
    consumer: Consumer,
    mux: Multiplexer,
    deadline: Instant,
    released: bool,
}

impl DispatchedTask {
    pub fn task_id(&self) -> TaskId {
        self.request.task_id
    }

    pub fn request(&self) -> &TaskRequest {
        &self.request
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the result until the deadline.
    ///
    /// `Ok(output)` on success, [`Error::TaskFailed`] when the worker
    /// reported an error, [`Error::Timeout`] when the deadline passed first.
    pub async fn wait(mut self) -> Result<Output> {
        let outcome = self.receive().await;
        self.release();

        let result = match &outcome {
            Ok(_) => "ok",
            Err(Error::Timeout { .. }) => "timeout",
            Err(_) => "failed",
        };
        metrics::task_outcomes().add(
            1,
            &[
                KeyValue::new("service", self.request.service.clone()),
                KeyValue::new("result", result),
            ],
        );
        outcome
    }

    async fn receive(&self) -> Result<Output> {
        let task_id = self.request.task_id;
        loop {
            let msg = match tokio::time::timeout_at(self.deadline, self.consumer.recv()).await {
                Err(_) => {
                    return Err(Error::Timeout {
                        task_id: task_id.to_string(),
                        timeout: self.request.timeout,
                    });
                }
                Ok(None) => return Err(Error::Closed(self.result_queue.clone())),
                Ok(Some(msg)) => msg,
            };

            if msg.correlation_id != self.consumer.correlation_id() {
                warn!(%task_id, got = %msg.correlation_id, "ignoring result for another task");
                continue;
            }
            match msg.decode_payload::<TaskResult>() {
                Ok(result) => return result.into_result(task_id),
                Err(e) => warn!(%task_id, error = %e, "ignoring malformed task result"),
            }
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.mux
                .close_response_consumer(&self.result_queue, self.consumer.correlation_id());
            self.released = true;
        }
    }
}

impl Drop for DispatchedTask {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DispatchedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedTask")
            .field("task_id", &self.request.task_id)
            .field("service", &self.request.service)
            .field("released", &self.released)
            .finish()
    }
}
