//! Metric instrument factories for pending-tasks.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"pending-tasks"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for pending-tasks instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("pending-tasks")
}

/// Counter: submissions.
/// Labels: `tag`, `result` ("queued" | "coalesced" | "rerun" | "error_resolved" | "invalid").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("pending.tasks.submitted")
        .with_description("Number of tasks submitted")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("pending.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: tasks the runner passed over.
/// Labels: `tag`, `reason`.
pub fn tasks_skipped() -> Counter<u64> {
    meter()
        .u64_counter("pending.tasks.skipped")
        .with_description("Number of tasks skipped by the runner")
        .build()
}

/// Counter: tasks dead-lettered because no runner handles the tag.
/// Labels: `tag`.
pub fn tasks_unroutable() -> Counter<u64> {
    meter()
        .u64_counter("pending.tasks.unroutable")
        .with_description("Tasks with no registered runner")
        .build()
}

/// Counter: store writes applied by the writer thread.
/// Labels: `operation`, `result` ("ok" | "error").
pub fn store_writes() -> Counter<u64> {
    meter()
        .u64_counter("pending.store.writes")
        .with_description("Number of store write operations")
        .build()
}

/// Histogram: task run duration in milliseconds.
/// Labels: `tag`, `success`.
pub fn task_run_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("pending.tasks.run_duration_ms")
        .with_description("Task run duration in milliseconds")
        .with_unit("ms")
        .build()
}
