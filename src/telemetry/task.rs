//! Task execution span helpers.

use tracing::Span;
use uuid::Uuid;

use crate::model::TaskId;

/// Start a span for one run of a task.
///
/// `run_id` tells apart the attempts of one task. The `task.state` field
/// is declared empty and filled in by [`record_state_transition`].
pub fn start_task_span(tag: &str, task_id: TaskId, run_id: &Uuid) -> Span {
    tracing::info_span!(
        "task.run",
        "task.tag" = tag,
        "task.id" = task_id.0,
        "task.run_id" = %run_id,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
