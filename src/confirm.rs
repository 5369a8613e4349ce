//! Publish-confirm tracking.
//!
//! The tracker is the broker's [`ConfirmListener`]. Every signal is logged and
//! counted. Callers that want to await a verdict register the publish first
//! and get a [`ConfirmHandle`]; the entry is removed as soon as the verdict
//! lands.
//!
//! Entries are keyed by the envelope's [`MessageId`], not its correlation
//! token: a worker's reply carries the request's token, and its signals must
//! never settle the request's publish.

use crate::broker::ConfirmListener;
use crate::error::{Error, Result};
use crate::model::{CorrelationToken, Envelope, MessageId, PublishOutcome};
use crate::telemetry::metrics;
use dashmap::DashMap;
use opentelemetry::KeyValue;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type Verdict = Result<PublishOutcome>;

struct Pending {
    token: CorrelationToken,
    tx: oneshot::Sender<Verdict>,
    /// Set when the broker returned the message as unroutable.
    returned: Option<String>,
}

/// Observes accept/reject/return signals and joins them to their publish.
#[derive(Default)]
pub struct ConfirmationTracker {
    pending: DashMap<MessageId, Pending>,
}

/// Awaitable broker verdict for one publish.
#[derive(Debug)]
pub struct ConfirmHandle {
    token: CorrelationToken,
    message_id: MessageId,
    rx: oneshot::Receiver<Verdict>,
}

impl ConfirmationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the verdict on the publish of `message_id`, which
    /// carries `token`. Call before publishing.
    pub fn register(&self, message_id: MessageId, token: CorrelationToken) -> ConfirmHandle {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            message_id,
            Pending {
                token,
                tx,
                returned: None,
            },
        );
        ConfirmHandle {
            token,
            message_id,
            rx,
        }
    }

    /// Withdraw a registration, e.g. when the publish itself failed.
    pub fn forget(&self, message_id: MessageId) {
        self.pending.remove(&message_id);
    }

    /// Publishes still waiting for a verdict.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn resolve(&self, message_id: MessageId, rejected: Option<&str>) {
        let Some((_, pending)) = self.pending.remove(&message_id) else {
            debug!(%message_id, "confirm for untracked publish");
            return;
        };
        let token = pending.token;
        let verdict = match (pending.returned, rejected) {
            (_, Some(reason)) => Err(Error::DeliveryRejected {
                token,
                reason: reason.to_string(),
            }),
            (Some(reason), None) => Err(Error::Unroutable { token, reason }),
            (None, None) => Ok(PublishOutcome {
                correlation_token: token,
                accepted: true,
                reason: None,
            }),
        };
        // The caller may have stopped waiting.
        let _ = pending.tx.send(verdict);
    }
}

impl ConfirmListener for ConfirmationTracker {
    fn on_accepted(&self, envelope: &Envelope) {
        info!(
            message_id = %envelope.message_id,
            token = ?envelope.correlation_token,
            "broker ack"
        );
        metrics::publish_confirmations().add(1, &[KeyValue::new("outcome", "accepted")]);
        self.resolve(envelope.message_id, None);
    }

    fn on_rejected(&self, envelope: &Envelope, reason: &str) {
        warn!(
            message_id = %envelope.message_id,
            token = ?envelope.correlation_token,
            reason,
            "broker nack"
        );
        metrics::publish_confirmations().add(1, &[KeyValue::new("outcome", "rejected")]);
        self.resolve(envelope.message_id, Some(reason));
    }

    fn on_returned(&self, envelope: &Envelope, reason: &str) {
        metrics::publish_confirmations().add(1, &[KeyValue::new("outcome", "returned")]);
        error!(
            message_id = %envelope.message_id,
            token = ?envelope.correlation_token,
            reason,
            reply_to = ?envelope.reply_to.as_ref().map(ToString::to_string),
            "message returned unroutable, check exchange bindings"
        );
        if let Some(mut pending) = self.pending.get_mut(&envelope.message_id) {
            pending.returned = Some(reason.to_string());
        }
    }
}

impl ConfirmHandle {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Wait for the broker's verdict.
    ///
    /// `Ok` means the broker accepted and routed the message. Rejections
    /// surface as [`Error::DeliveryRejected`], returns as [`Error::Unroutable`].
    pub async fn wait(self) -> Result<PublishOutcome> {
        let token = self.token;
        self.rx
            .await
            .map_err(|_| Error::Other(format!("confirm for {token} was abandoned")))?
    }

    /// Like [`wait`](Self::wait) with a local deadline. Giving up does not
    /// touch the broker; a late verdict is simply dropped.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<PublishOutcome> {
        let token = self.token;
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Error::Timeout(format!("broker confirm for {token}")))?
    }
}
