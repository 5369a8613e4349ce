//! Span helpers for the dispatch and delivery paths.

use crate::model::CorrelationToken;
use tracing::Span;

/// Start a span for a single dispatch call.
pub fn start_dispatch_span(job_id: &str, token: &CorrelationToken) -> Span {
    tracing::info_span!(
        "relay.dispatch",
        "work.job_id" = job_id,
        "messaging.correlation_id" = %token,
    )
}

/// Start a span for handling one delivery.
///
/// `messaging.correlation_id` may be empty for malformed deliveries.
/// The `relay.outcome` field is filled in by [`record_outcome`].
pub fn start_delivery_span(queue: &str, token: Option<&CorrelationToken>) -> Span {
    let span = tracing::info_span!(
        "relay.deliver",
        "messaging.destination.name" = queue,
        "messaging.correlation_id" = tracing::field::Empty,
        "relay.outcome" = tracing::field::Empty,
    );
    if let Some(token) = token {
        span.record("messaging.correlation_id", tracing::field::display(token));
    }
    span
}

/// Record how a delivery ended.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("relay.outcome", outcome);
}
