//! Span helpers for job execution and task invocation.

use tracing::Span;

/// Start a span covering one job's pipeline execution.
///
/// The `job.status` field is declared empty and filled in by
/// [`record_status`].
pub fn start_job_span(job_id: &str, job_name: &str) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = job_id,
        "job.name" = job_name,
        "job.status" = tracing::field::Empty,
    )
}

/// Start a span for one task invocation on a worker.
pub fn start_task_span(service: &str, task_id: &str, task_name: &str) -> Span {
    tracing::info_span!(
        "task.invoke",
        "task.service" = service,
        "task.id" = task_id,
        "task.name" = task_name,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a status change on a span created by this module.
pub fn record_status(span: &Span, field: &'static str, from: &str, to: &str) {
    span.record(field, to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "status_transition");
    });
}
