//! Work consumer.
//!
//! Each delivery is checked against the [`Deduplicator`], run at most once
//! per correlation token, followed by a notification and a reply to the
//! envelope's reply address. Nothing escapes the delivery boundary: every
//! delivery is acknowledged, whatever happened while handling it.

use crate::broker::{Broker, DeliveryHandler, HandlerFuture, Publish};
use crate::confirm::ConfirmationTracker;
use crate::dedup::Deduplicator;
use crate::error::{Error, Result};
use crate::model::{CorrelationToken, Delivery, Envelope, Status, WorkConfirmation, WorkRequest};
use crate::notify::Notifier;
use crate::telemetry::{metrics, spans};
use opentelemetry::KeyValue;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, error, info, warn};

/// What a job produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: Status,
    pub details: String,
}

/// The work itself. A pure function of the request.
pub trait Job: Send + Sync + 'static {
    fn execute(&self, request: &WorkRequest) -> Result<JobOutcome>;
}

/// Reports the payload length in UTF-16 code units, the unit the request's
/// producers count in.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadLengthJob;

impl Job for PayloadLengthJob {
    fn execute(&self, request: &WorkRequest) -> Result<JobOutcome> {
        Ok(JobOutcome {
            status: Status::Success,
            details: format!(
                "Processed payload length={}",
                request.payload.encode_utf16().count()
            ),
        })
    }
}

/// How the worker dealt with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Job ran; `replied` is false when no reply address was given, or when
    /// reply confirms are on and the broker did not route the reply.
    Processed { replied: bool },
    /// Token already seen; nothing done.
    Duplicate,
    /// Job or payload failed; `replied` when a FAILURE reply went out.
    Failed { replied: bool },
    /// No correlation token, so the delivery could not be deduplicated.
    Discarded,
}

impl Handled {
    fn label(self) -> &'static str {
        match self {
            Handled::Processed { .. } => "processed",
            Handled::Duplicate => "duplicate",
            Handled::Failed { .. } => "failed",
            Handled::Discarded => "discarded",
        }
    }
}

pub struct Worker<B, N, J = PayloadLengthJob> {
    broker: Arc<B>,
    dedup: Arc<Deduplicator>,
    notifier: Arc<N>,
    job: J,
    reply_confirms: Option<(Arc<ConfirmationTracker>, Duration)>,
}

impl<B: Broker, N: Notifier> Worker<B, N> {
    pub fn new(broker: Arc<B>, dedup: Arc<Deduplicator>, notifier: Arc<N>) -> Self {
        Self {
            broker,
            dedup,
            notifier,
            job: PayloadLengthJob,
            reply_confirms: None,
        }
    }
}

impl<B: Broker, N: Notifier, J: Job> Worker<B, N, J> {
    /// Replace the job run for each first-time delivery.
    pub fn with_job<K: Job>(self, job: K) -> Worker<B, N, K> {
        Worker {
            broker: self.broker,
            dedup: self.dedup,
            notifier: self.notifier,
            job,
            reply_confirms: self.reply_confirms,
        }
    }

    /// Wait up to `timeout` for the broker's verdict on each reply.
    /// `tracker` must be the broker's confirm listener.
    pub fn with_reply_confirms(mut self, tracker: Arc<ConfirmationTracker>, timeout: Duration) -> Self {
        self.reply_confirms = Some((tracker, timeout));
        self
    }

    /// Handle one delivery and acknowledge it.
    pub async fn handle(&self, delivery: Delivery) -> Handled {
        let token = delivery.envelope.correlation_token;
        let span = spans::start_delivery_span(&delivery.queue, token.as_ref());
        let start = Instant::now();

        let handled = self.process(&delivery).instrument(span.clone()).await;

        if let Err(e) = self.broker.ack(&delivery).await {
            warn!(parent: &span, tag = delivery.tag, "ack failed: {e}");
        }
        spans::record_outcome(&span, handled.label());
        metrics::work_deliveries().add(1, &[KeyValue::new("result", handled.label())]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "work.handle")],
        );
        handled
    }

    async fn process(&self, delivery: &Delivery) -> Handled {
        let Some(token) = delivery.envelope.correlation_token else {
            error!(tag = delivery.tag, "work delivery without correlation token, discarding");
            return Handled::Discarded;
        };

        if !self.dedup.first_time_seen(token) {
            info!(%token, redelivered = delivery.redelivered, "duplicate detected, skipping");
            return Handled::Duplicate;
        }

        let request: WorkRequest = match delivery.envelope.decode() {
            Ok(r) => r,
            Err(e) => {
                error!(%token, "{}", Error::ProcessingFailure(format!("bad payload: {e}")));
                return Handled::Failed { replied: false };
            }
        };

        info!(%token, job_id = %request.job_id, payload = %request.payload, "processing");

        let outcome = match self.run_job(&request) {
            Ok(outcome) => outcome,
            Err(e) => {
                let e = match e {
                    Error::ProcessingFailure(_) => e,
                    other => Error::ProcessingFailure(other.to_string()),
                };
                error!(%token, job_id = %request.job_id, "{e}");
                let failure = WorkConfirmation {
                    job_id: request.job_id,
                    status: Status::Failure,
                    details: e.to_string(),
                };
                let replied = self.reply(token, &delivery.envelope, &failure).await;
                return Handled::Failed { replied };
            }
        };

        self.notify(&request, &outcome);

        let confirmation = WorkConfirmation {
            job_id: request.job_id,
            status: outcome.status,
            details: outcome.details,
        };
        let replied = self.reply(token, &delivery.envelope, &confirmation).await;
        Handled::Processed { replied }
    }

    /// Run the job, turning a panic into a processing failure so the
    /// consumer survives it.
    fn run_job(&self, request: &WorkRequest) -> Result<JobOutcome> {
        catch_unwind(AssertUnwindSafe(|| self.job.execute(request))).unwrap_or_else(|panic| {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::ProcessingFailure(format!("job panicked: {reason}")))
        })
    }

    fn notify(&self, request: &WorkRequest, outcome: &JobOutcome) {
        let result = self.notifier.notify(
            &request.job_id,
            outcome.status,
            &outcome.details,
            request.notify_target.as_deref(),
        );
        match result {
            Ok(()) => {
                metrics::notifications().add(1, &[KeyValue::new("result", "ok")]);
            }
            Err(e) => {
                let e = match e {
                    Error::NotificationFailure(_) => e,
                    other => Error::NotificationFailure(other.to_string()),
                };
                warn!(job_id = %request.job_id, "{e}");
                metrics::notifications().add(1, &[KeyValue::new("result", "error")]);
            }
        }
    }

    /// Publish `confirmation` to the request's reply address. Returns whether
    /// a reply was handed to the broker (and, with reply confirms on, routed).
    async fn reply(
        &self,
        token: CorrelationToken,
        request: &Envelope,
        confirmation: &WorkConfirmation,
    ) -> bool {
        let Some(ref reply_to) = request.reply_to else {
            debug!(%token, "no reply address, skipping reply");
            return false;
        };

        let envelope = match Envelope::json(confirmation) {
            Ok(env) => env.correlated(token),
            Err(e) => {
                error!(%token, "cannot encode reply: {e}");
                return false;
            }
        };
        let message_id = envelope.message_id;
        let verdict = self
            .reply_confirms
            .as_ref()
            .map(|(tracker, timeout)| (tracker, tracker.register(message_id, token), *timeout));

        let publish = Publish::mandatory(&reply_to.exchange, &reply_to.routing_key, envelope);
        if let Err(e) = self.broker.publish(publish).await {
            if let Some((tracker, _, _)) = verdict {
                tracker.forget(message_id);
            }
            error!(%token, reply_to = %reply_to, "reply publish failed: {e}");
            return false;
        }

        if let Some((_, handle, timeout)) = verdict {
            if let Err(e) = handle.wait_timeout(timeout).await {
                error!(%token, reply_to = %reply_to, "reply not delivered: {e}");
                return false;
            }
        }
        info!(%token, reply_to = %reply_to, status = %confirmation.status, "replied");
        true
    }
}

impl<B: Broker, N: Notifier, J: Job> DeliveryHandler for Worker<B, N, J> {
    fn handle_delivery(&self, delivery: Delivery) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.handle(delivery).await;
        })
    }
}
