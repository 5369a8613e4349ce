//! Core data model.
//!
//! A work request travels inside an [`Envelope`] whose metadata (correlation
//! token, reply address, persistence flag) is kept apart from the payload so
//! producer and consumer schemas can evolve independently.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Content type stamped on every envelope.
pub const CONTENT_TYPE_JSON: &str = "application/json";

// ---------------------------------------------------------------------------
// Work Request / Confirmation
// ---------------------------------------------------------------------------

/// A unit of work submitted by a caller of the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    pub job_id: String,
    pub payload: String,
    /// Where to send the completion notice. `None` falls back to the
    /// notifier's default recipient.
    #[serde(rename = "notifyEmail", default)]
    pub notify_target: Option<String>,
}

impl WorkRequest {
    pub fn new(job_id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            payload: payload.into(),
            notify_target: None,
        }
    }

    pub fn notify(mut self, target: impl Into<String>) -> Self {
        self.notify_target = Some(target.into());
        self
    }
}

/// Outcome status of an executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    Failure,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Success => "SUCCESS",
            Status::Failure => "FAILURE",
        };
        write!(f, "{s}")
    }
}

/// Reply sent by a worker once a job has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkConfirmation {
    pub job_id: String,
    pub status: Status,
    pub details: String,
}

// ---------------------------------------------------------------------------
// Correlation
// ---------------------------------------------------------------------------

/// Join key across the work message, its publish confirm, and its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(pub Uuid);

impl CorrelationToken {
    /// Mint a fresh random (v4) token.
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CorrelationToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Other(format!("bad correlation token {s:?}: {e}")))
    }
}

/// Identity of one published message, distinct for every publish even when
/// request and reply share a correlation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker-routable destination for a reply, written `exchange/routing_key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyAddress {
    pub exchange: String,
    pub routing_key: String,
}

impl ReplyAddress {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Address `queue` directly through the default exchange.
    pub fn direct(queue: impl Into<String>) -> Self {
        Self::new("", queue)
    }

    pub fn is_direct(&self) -> bool {
        self.exchange.is_empty()
    }
}

impl std::fmt::Display for ReplyAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

impl std::str::FromStr for ReplyAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // A bare name is a routing key on the default exchange.
        match s.split_once('/') {
            Some((exchange, routing_key)) => Ok(Self::new(exchange, routing_key)),
            None if !s.is_empty() => Ok(Self::new("", s)),
            None => Err(Error::Other("empty reply address".to_string())),
        }
    }
}

impl Serialize for ReplyAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ReplyAddress {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Envelope / Delivery
// ---------------------------------------------------------------------------

/// A payload plus its out-of-band message properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Fresh per envelope; confirms are joined to publishes by this id.
    #[serde(default = "MessageId::mint")]
    pub message_id: MessageId,
    pub correlation_token: Option<CorrelationToken>,
    pub reply_to: Option<ReplyAddress>,
    /// Ask the broker to write the message to disk.
    pub persistent: bool,
    pub content_type: String,
    pub body: serde_json::Value,
}

impl Envelope {
    /// Wrap a serializable payload as a JSON envelope.
    pub fn json<T: Serialize>(payload: &T) -> Result<Self> {
        Ok(Self {
            message_id: MessageId::mint(),
            correlation_token: None,
            reply_to: None,
            persistent: false,
            content_type: CONTENT_TYPE_JSON.to_string(),
            body: serde_json::to_value(payload)?,
        })
    }

    pub fn correlated(mut self, token: CorrelationToken) -> Self {
        self.correlation_token = Some(token);
        self
    }

    pub fn reply_to(mut self, address: ReplyAddress) -> Self {
        self.reply_to = Some(address);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Decode the body into a typed payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.content_type != CONTENT_TYPE_JSON {
            return Err(Error::Other(format!(
                "unsupported content type {}",
                self.content_type
            )));
        }
        Ok(T::deserialize(&self.body)?)
    }
}

/// One delivery of an envelope from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker handle used to acknowledge this delivery.
    pub tag: u64,
    pub queue: String,
    /// Set when the broker has handed this message out before.
    pub redelivered: bool,
    pub envelope: Envelope,
}

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

/// Broker verdict on a single publish. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub correlation_token: CorrelationToken,
    pub accepted: bool,
    pub reason: Option<String>,
}

/// A dedup store entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupRecord {
    pub token: CorrelationToken,
    pub first_seen_at_millis: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_request_uses_field_names_on_the_wire() {
        let req = WorkRequest::new("JOB-1", "hello").notify("ops@example.com");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jobId"], "JOB-1");
        assert_eq!(json["payload"], "hello");
        assert_eq!(json["notifyEmail"], "ops@example.com");
    }

    #[test]
    fn work_request_without_notify_target_decodes() {
        let req: WorkRequest =
            serde_json::from_value(serde_json::json!({"jobId": "J", "payload": "p"})).unwrap();
        assert_eq!(req.notify_target, None);
    }

    #[test]
    fn status_serializes_upper_case() {
        let conf = WorkConfirmation {
            job_id: "J1".to_string(),
            status: Status::Success,
            details: "ok".to_string(),
        };
        let json = serde_json::to_value(&conf).unwrap();
        assert_eq!(json["status"], "SUCCESS");
        assert_eq!(Status::Failure.to_string(), "FAILURE");
    }

    #[test]
    fn reply_address_parses_exchange_and_key() {
        let addr: ReplyAddress = "app.direct/reply".parse().unwrap();
        assert_eq!(addr, ReplyAddress::new("app.direct", "reply"));
        assert_eq!(addr.to_string(), "app.direct/reply");

        let bare: ReplyAddress = "reply.queue".parse().unwrap();
        assert_eq!(bare.exchange, "");
        assert!(bare.is_direct());
        assert!("".parse::<ReplyAddress>().is_err());

        let direct = ReplyAddress::direct("reply.client-1");
        assert_eq!(direct.to_string().parse::<ReplyAddress>().unwrap(), direct);
    }

    #[test]
    fn tokens_are_unique_and_parse_back() {
        let a = CorrelationToken::mint();
        let b = CorrelationToken::mint();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<CorrelationToken>().unwrap(), a);
    }

    #[test]
    fn every_envelope_gets_its_own_message_id() {
        let token = CorrelationToken::mint();
        let request = Envelope::json(&WorkRequest::new("J", "p")).unwrap().correlated(token);
        let reply = Envelope::json(&WorkRequest::new("J", "p")).unwrap().correlated(token);
        assert_ne!(request.message_id, reply.message_id);

        let mut wire = serde_json::to_value(&request).unwrap();
        wire.as_object_mut().unwrap().remove("message_id");
        let decoded: Envelope = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded.correlation_token, Some(token));
    }

    #[test]
    fn envelope_rejects_foreign_content_type() {
        let mut env = Envelope::json(&WorkRequest::new("J", "p")).unwrap();
        env.content_type = "text/plain".to_string();
        assert!(env.decode::<WorkRequest>().is_err());
    }
}
