//! Structured events emitted by job workers while a pipeline runs.
//!
//! Events are the only way to observe a submitted job. They are
//! best-effort: publishing never waits on a full buffer, so a slow or
//! absent event consumer cannot stall job progress.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::BrokerMessage;
use crate::model::JobId;
use crate::mux::{Multiplexer, Producer};
use crate::queues;
use crate::telemetry::metrics;

/// A structured event tied to a job, and optionally to one of its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub job_id: JobId,
    /// Position of the task in document order across all stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_index: Option<usize>,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(job_id: JobId, task_index: Option<usize>, kind: EventKind) -> Self {
        Self {
            job_id,
            task_index,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// The queue this event is published on.
    pub fn queue(&self) -> &'static str {
        match self.kind {
            EventKind::Status { .. } => queues::EVENT_STATUS,
            EventKind::Message { .. } => queues::EVENT_MESSAGE,
            EventKind::Variable { .. } => queues::EVENT_VARIABLE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Status {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Message {
        level: Level,
        text: String,
    },
    Variable {
        name: String,
        value: serde_json::Value,
    },
}

/// Job statuses are `Running`, `Completed` and `Failed`; task statuses are
/// `Skipped`, `Running`, `Succeeded` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Running,
    Completed,
    Failed,
    Skipped,
    Succeeded,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Succeeded => "succeeded",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Publishes events on the three event queues.
#[derive(Clone)]
pub struct EventPublisher {
    status: Producer,
    message: Producer,
    variable: Producer,
}

impl EventPublisher {
    pub fn new(mux: &Multiplexer) -> Self {
        Self {
            status: mux.register_producer(queues::EVENT_STATUS),
            message: mux.register_producer(queues::EVENT_MESSAGE),
            variable: mux.register_producer(queues::EVENT_VARIABLE),
        }
    }

    /// Hand the event to its producer. Returns whether it was accepted;
    /// a full buffer or a closed multiplexer drops it.
    pub fn publish(&self, event: Event) -> bool {
        let producer = match event.kind {
            EventKind::Status { .. } => &self.status,
            EventKind::Message { .. } => &self.message,
            EventKind::Variable { .. } => &self.variable,
        };
        let msg = match BrokerMessage::json(event.job_id.to_string(), &event) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "cannot encode event");
                return false;
            }
        };

        let dropped = match producer.try_publish(msg) {
            Ok(true) => return true,
            Ok(false) => "buffer_full",
            Err(e) => {
                debug!(error = %e, "event not published");
                "closed"
            }
        };
        warn!(
            job_id = %event.job_id,
            queue = event.queue(),
            reason = dropped,
            "event dropped"
        );
        metrics::events_dropped().add(
            1,
            &[
                KeyValue::new("queue", event.queue()),
                KeyValue::new("reason", dropped),
            ],
        );
        false
    }

    pub fn status(&self, job_id: JobId, task_index: Option<usize>, status: Status) -> bool {
        self.publish(Event::new(
            job_id,
            task_index,
            EventKind::Status {
                status,
                error: None,
            },
        ))
    }

    pub fn failure(&self, job_id: JobId, task_index: Option<usize>, error: impl Into<String>) -> bool {
        self.publish(Event::new(
            job_id,
            task_index,
            EventKind::Status {
                status: Status::Failed,
                error: Some(error.into()),
            },
        ))
    }

    pub fn message(
        &self,
        job_id: JobId,
        task_index: Option<usize>,
        level: Level,
        text: impl Into<String>,
    ) -> bool {
        self.publish(Event::new(
            job_id,
            task_index,
            EventKind::Message {
                level,
                text: text.into(),
            },
        ))
    }

    pub fn variable(
        &self,
        job_id: JobId,
        task_index: Option<usize>,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> bool {
        self.publish(Event::new(
            job_id,
            task_index,
            EventKind::Variable {
                name: name.into(),
                value,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_event_wire_shape() {
        let job_id = JobId::new();
        let event = Event::new(
            job_id,
            Some(2),
            EventKind::Status {
                status: Status::Skipped,
                error: None,
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["jobId"], json!(job_id.to_string()));
        assert_eq!(value["taskIndex"], json!(2));
        assert_eq!(value["kind"]["type"], json!("status"));
        assert_eq!(value["kind"]["status"], json!("skipped"));
        assert!(value["kind"].get("error").is_none());

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn job_level_event_omits_task_index() {
        let event = Event::new(
            JobId::new(),
            None,
            EventKind::Message {
                level: Level::Info,
                text: "deployed".into(),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("taskIndex").is_none());
        assert_eq!(value["kind"]["level"], json!("info"));
        assert_eq!(event.queue(), queues::EVENT_MESSAGE);
    }
}
