//! Metric instrument factories for dips.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"dips"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for dips instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("dips")
}

/// Counter: broker-level queue operations (create, send, read, delete, ...).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("dips.queue.operations")
        .with_description("Number of broker queue operations")
        .build()
}

/// Counter: messages handed to the broker by producer dispatchers.
/// Labels: `queue`.
pub fn messages_published() -> Counter<u64> {
    meter()
        .u64_counter("dips.mux.published")
        .with_description("Messages published through the multiplexer")
        .build()
}

/// Counter: deliveries discarded by consumer dispatchers.
/// Labels: `reason` ("expired" | "redelivered").
pub fn deliveries_dropped() -> Counter<u64> {
    meter()
        .u64_counter("dips.mux.dropped")
        .with_description("Deliveries dropped by the multiplexer")
        .build()
}

/// Counter: broker connection losses.
pub fn reconnects() -> Counter<u64> {
    meter()
        .u64_counter("dips.mux.reconnects")
        .with_description("Number of broker reconnects")
        .build()
}

/// Counter: task requests dispatched by RPC clients.
/// Labels: `service`.
pub fn tasks_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("dips.task.dispatched")
        .with_description("Number of task requests dispatched")
        .build()
}

/// Counter: task outcomes observed by callers.
/// Labels: `service`, `result` ("ok" | "failed" | "timeout").
pub fn task_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("dips.task.outcomes")
        .with_description("Task outcomes observed by callers")
        .build()
}

/// Histogram: handler execution time on the worker side.
/// Labels: `service`, `result`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("dips.task.duration_ms")
        .with_description("Task handler duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: job outcomes.
/// Labels: `result` ("completed" | "failed").
pub fn jobs_finished() -> Counter<u64> {
    meter()
        .u64_counter("dips.job.finished")
        .with_description("Number of jobs finished")
        .build()
}

/// Counter: events that could not be buffered.
/// Labels: `kind`.
pub fn events_dropped() -> Counter<u64> {
    meter()
        .u64_counter("dips.event.dropped")
        .with_description("Events dropped because the local buffer was full")
        .build()
}
