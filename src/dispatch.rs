//! Work dispatch.
//!
//! Mints a correlation token per request, wraps the request in a persistent
//! envelope carrying the reply address, and publishes it to the work route.
//! Returns as soon as the broker has the message; the verdict arrives later
//! through the [`ConfirmationTracker`].

use crate::broker::{Broker, Publish};
use crate::confirm::{ConfirmHandle, ConfirmationTracker};
use crate::error::{Error, Result};
use crate::model::{CorrelationToken, Envelope, ReplyAddress, WorkRequest};
use crate::reply::{ReplyCorrelator, ReplyHandle};
use crate::telemetry::{metrics, spans};
use crate::topology::Topology;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, info, warn};

/// A dispatched request and its pending broker verdict.
#[derive(Debug)]
pub struct Dispatched {
    pub token: CorrelationToken,
    pub confirmation: ConfirmHandle,
}

/// A dispatched request that also expects a reply.
#[derive(Debug)]
pub struct PendingRequest {
    pub token: CorrelationToken,
    pub confirmation: ConfirmHandle,
    pub reply: ReplyHandle,
}

pub struct Dispatcher<B> {
    broker: Arc<B>,
    topology: Topology,
    tracker: Arc<ConfirmationTracker>,
    routing_key: String,
    reply_to: ReplyAddress,
}

impl<B: Broker> Dispatcher<B> {
    pub fn new(broker: Arc<B>, topology: Topology, tracker: Arc<ConfirmationTracker>) -> Self {
        let routing_key = topology.work_routing_key.clone();
        let reply_to = topology.reply_address();
        Self {
            broker,
            topology,
            tracker,
            routing_key,
            reply_to,
        }
    }

    /// Publish under a routing key other than the topology's work key.
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Ask workers to reply somewhere other than the shared reply queue,
    /// typically a queue only this requester consumes.
    pub fn with_reply_address(mut self, reply_to: ReplyAddress) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// Send one work request. Never waits for the broker's verdict.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRequest`] for an empty job id,
    /// [`Error::TransportUnavailable`] when the broker cannot be reached; in
    /// that case nothing was sent and retrying is up to the caller.
    pub async fn dispatch(&self, request: WorkRequest) -> Result<Dispatched> {
        let token = CorrelationToken::mint();
        let confirmation = self.send(token, &request).await?;
        Ok(Dispatched {
            token,
            confirmation,
        })
    }

    /// Like [`dispatch`](Self::dispatch), and register with `correlator` first
    /// so the reply cannot outrun its waiter.
    pub async fn request(
        &self,
        request: WorkRequest,
        correlator: &Arc<ReplyCorrelator>,
    ) -> Result<PendingRequest> {
        let token = CorrelationToken::mint();
        let reply = correlator.expect(token);
        match self.send(token, &request).await {
            Ok(confirmation) => Ok(PendingRequest {
                token,
                confirmation,
                reply,
            }),
            Err(e) => {
                correlator.forget(token);
                Err(e)
            }
        }
    }

    async fn send(&self, token: CorrelationToken, request: &WorkRequest) -> Result<ConfirmHandle> {
        if request.job_id.trim().is_empty() {
            return Err(Error::InvalidRequest("jobId must not be empty".to_string()));
        }

        let span = spans::start_dispatch_span(&request.job_id, &token);
        self.publish_work(token, request).instrument(span).await
    }

    async fn publish_work(
        &self,
        token: CorrelationToken,
        request: &WorkRequest,
    ) -> Result<ConfirmHandle> {
        let start = Instant::now();
        let envelope = Envelope::json(request)?
            .correlated(token)
            .reply_to(self.reply_to.clone())
            .persistent();
        let message_id = envelope.message_id;

        // Registered before publishing: the confirm may beat us back.
        let confirmation = self.tracker.register(message_id, token);
        let publish = Publish::mandatory(&self.topology.exchange, &self.routing_key, envelope);

        if let Err(e) = self.broker.publish(publish).await {
            self.tracker.forget(message_id);
            warn!(job_id = %request.job_id, %token, "dispatch failed: {e}");
            metrics::work_dispatched().add(1, &[KeyValue::new("result", "transport_unavailable")]);
            return Err(match e {
                Error::TransportUnavailable(_) => e,
                other => Error::TransportUnavailable(other.to_string()),
            });
        }

        info!(job_id = %request.job_id, %token, "work dispatched");
        metrics::work_dispatched().add(1, &[KeyValue::new("result", "ok")]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "dispatch")],
        );
        Ok(confirmation)
    }
}
