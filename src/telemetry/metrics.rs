//! Metric instrument factories for crowdsched.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"crowdsched"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for crowdsched instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("crowdsched")
}

/// Counter: scheduling requests.
/// Labels: `policy`, `result` ("task" | "empty" | "contended").
pub fn tasks_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("crowdsched.tasks.scheduled")
        .with_description("Number of next-task requests")
        .build()
}

/// Counter: reservation operations.
/// Labels: `result` ("acquired" | "held" | "refreshed" | "released").
pub fn reservations() -> Counter<u64> {
    meter()
        .u64_counter("crowdsched.reservations")
        .with_description("Number of reservation operations")
        .build()
}

/// Counter: answers recorded.
/// Labels: `state` (task state after the answer).
pub fn answers_recorded() -> Counter<u64> {
    meter()
        .u64_counter("crowdsched.answers.recorded")
        .with_description("Number of answers recorded")
        .build()
}

/// Counter: redundancy edits.
/// Labels: `effect` ("unchanged" | "reopened" | "completed").
pub fn redundancy_changes() -> Counter<u64> {
    meter()
        .u64_counter("crowdsched.redundancy.changes")
        .with_description("Number of redundancy edits by lifecycle effect")
        .build()
}

/// Counter: bulk routing decisions.
/// Labels: `kind`, `route` ("inline" | "enqueued").
pub fn bulk_routed() -> Counter<u64> {
    meter()
        .u64_counter("crowdsched.bulk.routed")
        .with_description("Number of bulk mutations routed")
        .build()
}

/// Counter: bulk jobs finished by the worker.
/// Labels: `kind`, `result` ("ok" | "retry" | "dead_letter").
pub fn bulk_jobs() -> Counter<u64> {
    meter()
        .u64_counter("crowdsched.bulk.jobs")
        .with_description("Number of queued bulk jobs processed")
        .build()
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("crowdsched.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: expired lock-store entries physically removed.
pub fn lock_purges() -> Counter<u64> {
    meter()
        .u64_counter("crowdsched.locks.purged")
        .with_description("Expired lock-store entries removed by the sweep")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("crowdsched.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
