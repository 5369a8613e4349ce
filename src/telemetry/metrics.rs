//! Metric instrument factories for relay-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! With no provider installed the instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("relay-rs")
}

/// Counter: work requests handed to the broker.
/// Labels: `result` ("ok" | "transport_unavailable").
pub fn work_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("relay.work.dispatched")
        .with_description("Number of work requests dispatched")
        .build()
}

/// Counter: broker confirm signals.
/// Labels: `outcome` ("accepted" | "rejected" | "returned").
pub fn publish_confirmations() -> Counter<u64> {
    meter()
        .u64_counter("relay.publish.confirmations")
        .with_description("Publish confirm signals observed from the broker")
        .build()
}

/// Counter: work deliveries handled by workers.
/// Labels: `result` ("processed" | "duplicate" | "failed" | "discarded").
pub fn work_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("relay.work.deliveries")
        .with_description("Work deliveries handled")
        .build()
}

/// Counter: queue-level operations (create, send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("relay.queue.operations")
        .with_description("Number of pgmq queue operations")
        .build()
}

/// Counter: tokens evicted from the dedup store.
pub fn dedup_evictions() -> Counter<u64> {
    meter()
        .u64_counter("relay.dedup.evictions")
        .with_description("Correlation tokens evicted by the dedup sweep")
        .build()
}

/// Counter: notification attempts.
/// Labels: `result` ("ok" | "error").
pub fn notifications() -> Counter<u64> {
    meter()
        .u64_counter("relay.notifications")
        .with_description("Job completion notifications")
        .build()
}

/// Counter: replies seen by the correlator.
/// Labels: `result` ("matched" | "unknown" | "malformed").
pub fn replies() -> Counter<u64> {
    meter()
        .u64_counter("relay.replies")
        .with_description("Reply deliveries correlated")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("relay.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
