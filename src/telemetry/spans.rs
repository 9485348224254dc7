//! Span helpers for scheduling and bulk execution.

use tracing::Span;

/// Start a span for one next-task request. `task.id` is filled in by
/// [`record_scheduled_task`] when a task is picked.
pub fn start_schedule_span(project: i64, policy: &str, requester: &str) -> Span {
    tracing::info_span!(
        "sched.next_task",
        "project.id" = project,
        "sched.policy" = policy,
        "requester" = requester,
        "task.id" = tracing::field::Empty,
    )
}

pub fn record_scheduled_task(span: &Span, task: i64) {
    span.record("task.id", task);
}

/// Start a span for a bulk mutation. `bulk.route` is recorded once the
/// router has decided.
pub fn start_bulk_span(kind: &str, job_id: &str, project: i64) -> Span {
    tracing::info_span!(
        "bulk.execute",
        "bulk.kind" = kind,
        "bulk.job_id" = job_id,
        "project.id" = project,
        "bulk.estimate" = tracing::field::Empty,
        "bulk.route" = tracing::field::Empty,
    )
}

/// Record the routing decision and emit an event inside the span.
pub fn record_route(span: &Span, estimate: u64, route: &str) {
    span.record("bulk.estimate", estimate);
    span.record("bulk.route", route);
    span.in_scope(|| {
        tracing::info!(estimate, route, "bulk_routed");
    });
}
