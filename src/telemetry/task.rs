//! Task span helpers.
//!
//! Provides span creation and state-transition recording for tasks flowing
//! through the queue.

use tracing::Span;

/// Start a span for one queue operation on a task.
///
/// The `task.status` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_task_span(operation: &str, task_uuid: &str) -> Span {
    tracing::info_span!(
        "ce.task",
        "task.operation" = operation,
        "task.uuid" = task_uuid,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
///
/// Emits a tracing `info` event scoped to the span and stores the new
/// status in its `task.status` field.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
