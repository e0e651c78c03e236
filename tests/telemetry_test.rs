//! Integration tests for telemetry initialization and span helpers.

use dips::telemetry::{TelemetryConfig, init_telemetry, metrics, spans};
use opentelemetry::KeyValue;
use uuid::Uuid;

#[test]
fn telemetry_initializes_without_endpoint() {
    let config = TelemetryConfig {
        endpoint: None,
        service_name: "dips-test".to_string(),
        default_level: "debug".to_string(),
    };
    // Err when another test in this process already set a subscriber.
    let _guard = init_telemetry(config);
}

#[test]
fn job_span_records_transitions() {
    let id = Uuid::new_v4().to_string();
    let span = spans::start_job_span(&id, "nightly");
    spans::record_status(&span, "job.status", "pending", "running");
    spans::record_status(&span, "job.status", "running", "completed");
}

#[test]
fn task_span_records_transition() {
    let id = Uuid::new_v4().to_string();
    let span = spans::start_task_span("shell", &id, "compile");
    spans::record_status(&span, "task.status", "pending", "running");
}

#[test]
fn instruments_accept_recordings_without_provider() {
    metrics::tasks_dispatched().add(1, &[KeyValue::new("service", "shell")]);
    metrics::task_duration_ms().record(12.5, &[KeyValue::new("result", "succeeded")]);
    metrics::jobs_finished().add(1, &[KeyValue::new("result", "completed")]);
}
