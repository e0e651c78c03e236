//! Core data model.
//!
//! Jobs carry a pipeline of stages; each stage runs its tasks in order, and
//! each task becomes one [`TaskRequest`] sent to a named service, answered
//! by exactly one [`TaskResult`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Task inputs and outputs: a JSON object.
pub type Output = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Globally unique task id. Doubles as the RPC correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Task request / result
// ---------------------------------------------------------------------------

/// Which job (and which task of it) a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub job_id: JobId,
    /// Position of the task in the flattened pipeline.
    pub task_index: usize,
}

/// One unit of work sent to a task service. Immutable once dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub name: String,
    pub service: String,
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_ref: Option<JobRef>,
    #[serde(default)]
    pub parameters: Output,
}

/// The single reply to a [`TaskRequest`]. Failure is a delivered result
/// with `error` set, never a missing reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Output,
}

impl TaskResult {
    pub fn ok(output: Output) -> Self {
        Self {
            error: None,
            output,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            output: Output::new(),
        }
    }

    /// Turn the wire result into the caller-facing outcome.
    pub fn into_result(self, task_id: TaskId) -> Result<Output> {
        match self.error {
            Some(message) => Err(Error::TaskFailed {
                task_id: task_id.to_string(),
                message,
            }),
            None => Ok(self.output),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A parsed pipeline document: stages run in order, tasks within a stage
/// run in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<PipelineTask>,
}

/// One task entry in a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTask {
    pub name: String,
    pub service: String,
    #[serde(default)]
    pub parameters: Output,
    /// Keep going when this task fails.
    #[serde(default)]
    pub ignore_errors: bool,
    /// Store the task's output under this variable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
    /// Message event emitted when the task succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<String>,
    /// Guard expression; the task runs only if it evaluates to "true".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Per-task timeout, overriding the job worker default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl PipelineTask {
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            parameters: Output::new(),
            ignore_errors: false,
            register: None,
            notify: None,
            when: None,
            timeout_secs: None,
        }
    }

    pub fn parameters(mut self, parameters: Output) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    pub fn register(mut self, name: impl Into<String>) -> Self {
        self.register = Some(name.into());
        self
    }

    pub fn notify(mut self, message: impl Into<String>) -> Self {
        self.notify = Some(message.into());
        self
    }

    pub fn when(mut self, expr: impl Into<String>) -> Self {
        self.when = Some(expr.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Pipeline {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Decode(format!("pipeline json: {e}")))
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Decode(format!("pipeline toml: {e}")))
    }

    /// Load a pipeline document; `.toml` files are parsed as TOML,
    /// anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "toml") {
            Self::from_toml(&content)
        } else {
            Self::from_json(&content)
        }
    }

    /// Number of tasks across all stages.
    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A pipeline instantiation, self-describing: the worker needs nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub pipeline: Pipeline,
    /// Initial variables visible to guards and parameter templates.
    #[serde(default)]
    pub parameters: Output,
}

impl Job {
    pub fn new(name: impl Into<String>, pipeline: Pipeline) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            pipeline,
            parameters: Output::new(),
        }
    }

    pub fn parameters(mut self, parameters: Output) -> Self {
        self.parameters = parameters;
        self
    }
}

/// What travels on the job queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job: Job,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
