//! Reply correlation.
//!
//! Replies arrive on the reply queue tagged with the correlation token of the
//! request that produced them. The correlator joins each reply to whoever is
//! waiting on that token. A reply nobody waits for is reported, not dropped:
//! the requesting process may simply have restarted.

use crate::broker::{DeliveryHandler, HandlerFuture};
use crate::error::{Error, Result};
use crate::model::{CorrelationToken, Delivery, WorkConfirmation};
use crate::telemetry::{metrics, spans};
use dashmap::DashMap;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// How a reply delivery was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Handed to the waiter registered for the token.
    Matched {
        token: CorrelationToken,
        confirmation: WorkConfirmation,
    },
    /// Valid reply, but no waiter for its token.
    Unknown {
        token: CorrelationToken,
        confirmation: WorkConfirmation,
    },
    /// Missing token or undecodable body.
    Malformed,
}

/// Joins reply deliveries to outstanding requests by correlation token.
#[derive(Debug, Default)]
pub struct ReplyCorrelator {
    waiters: DashMap<CorrelationToken, oneshot::Sender<WorkConfirmation>>,
}

/// Awaitable reply for one request.
#[derive(Debug)]
pub struct ReplyHandle {
    token: CorrelationToken,
    rx: oneshot::Receiver<WorkConfirmation>,
    correlator: Arc<ReplyCorrelator>,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply for `token`. Call before dispatching.
    pub fn expect(self: &Arc<Self>, token: CorrelationToken) -> ReplyHandle {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(token, tx);
        ReplyHandle {
            token,
            rx,
            correlator: Arc::clone(self),
        }
    }

    pub fn forget(&self, token: CorrelationToken) {
        self.waiters.remove(&token);
    }

    /// Requests still waiting for a reply.
    pub fn outstanding(&self) -> usize {
        self.waiters.len()
    }

    /// Extract token and confirmation from a reply delivery and join them.
    ///
    /// Reply deliveries are not acknowledged here; see [`ReplyListener`].
    pub fn handle(&self, delivery: &Delivery) -> Correlation {
        let span = spans::start_delivery_span(
            &delivery.queue,
            delivery.envelope.correlation_token.as_ref(),
        );
        let _enter = span.enter();

        let Some(token) = delivery.envelope.correlation_token else {
            error!(tag = delivery.tag, "reply without correlation token");
            return self.malformed(&span);
        };
        let confirmation: WorkConfirmation = match delivery.envelope.decode() {
            Ok(c) => c,
            Err(e) => {
                error!(%token, "undecodable reply: {e}");
                return self.malformed(&span);
            }
        };

        info!(
            %token,
            job_id = %confirmation.job_id,
            status = %confirmation.status,
            details = %confirmation.details,
            "reply received"
        );

        let waiter = self.waiters.remove(&token).map(|(_, tx)| tx);
        match waiter {
            Some(tx) => {
                if tx.send(confirmation.clone()).is_err() {
                    warn!(%token, "reply waiter went away before the reply arrived");
                }
                metrics::replies().add(1, &[KeyValue::new("result", "matched")]);
                spans::record_outcome(&span, "matched");
                Correlation::Matched {
                    token,
                    confirmation,
                }
            }
            None => {
                warn!("{}", Error::UnknownReplyToken(token));
                metrics::replies().add(1, &[KeyValue::new("result", "unknown")]);
                spans::record_outcome(&span, "unknown");
                Correlation::Unknown {
                    token,
                    confirmation,
                }
            }
        }
    }

    fn malformed(&self, span: &tracing::Span) -> Correlation {
        metrics::replies().add(1, &[KeyValue::new("result", "malformed")]);
        spans::record_outcome(span, "malformed");
        Correlation::Malformed
    }
}

impl ReplyHandle {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    pub async fn wait(mut self) -> Result<WorkConfirmation> {
        let token = self.token;
        (&mut self.rx)
            .await
            .map_err(|_| Error::Other(format!("reply waiter for {token} was dropped")))
    }

    /// Wait up to `timeout`. On timeout the waiter is withdrawn; the request
    /// stays in flight at the broker and a late reply is reported as unknown.
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<WorkConfirmation> {
        let token = self.token;
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(reply) => {
                reply.map_err(|_| Error::Other(format!("reply waiter for {token} was dropped")))
            }
            Err(_) => Err(Error::Timeout(format!("reply for {token}"))),
        }
    }
}

/// A handle dropped before its reply arrived withdraws the waiter.
impl Drop for ReplyHandle {
    fn drop(&mut self) {
        self.correlator.forget(self.token);
    }
}

/// Consumer-side adapter: correlate each reply delivery, then acknowledge it.
pub struct ReplyListener<B> {
    broker: Arc<B>,
    correlator: Arc<ReplyCorrelator>,
}

impl<B: crate::broker::Broker> ReplyListener<B> {
    pub fn new(broker: Arc<B>, correlator: Arc<ReplyCorrelator>) -> Self {
        Self { broker, correlator }
    }

    pub async fn on_reply(&self, delivery: Delivery) -> Correlation {
        let correlation = self.correlator.handle(&delivery);
        if let Err(e) = self.broker.ack(&delivery).await {
            warn!(tag = delivery.tag, "reply ack failed: {e}");
        }
        correlation
    }
}

impl<B: crate::broker::Broker> DeliveryHandler for ReplyListener<B> {
    fn handle_delivery(&self, delivery: Delivery) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.on_reply(delivery).await;
        })
    }
}
