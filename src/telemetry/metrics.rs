//! Metric instrument factories for ce-queue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"ce-queue"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for ce-queue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("ce-queue")
}

/// Counter: tasks accepted into the queue.
/// Labels: `task_type`.
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("ce.queue.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: successful claims.
/// Labels: `task_type`.
pub fn tasks_claimed() -> Counter<u64> {
    meter()
        .u64_counter("ce.queue.claimed")
        .with_description("Number of tasks claimed by workers")
        .build()
}

/// Counter: tasks moved to the activity store.
/// Labels: `task_type`, `status` ("SUCCESS" | "FAILED" | "CANCELED").
pub fn tasks_finished() -> Counter<u64> {
    meter()
        .u64_counter("ce.queue.finished")
        .with_description("Number of tasks archived with a terminal outcome")
        .build()
}

/// Histogram: time between claim and removal.
/// Labels: `status`.
pub fn execution_time_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("ce.queue.execution_time_ms")
        .with_description("Task execution time in milliseconds")
        .with_unit("ms")
        .build()
}
