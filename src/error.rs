//! Error types for relay-rs.
//!
//! Only `TransportUnavailable` (and request validation) reaches the caller of
//! `dispatch` synchronously. The other protocol variants travel through the
//! confirmation handles, reply handles, and logs.

use crate::model::CorrelationToken;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("broker transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("broker rejected message {token}: {reason}")]
    DeliveryRejected {
        token: CorrelationToken,
        reason: String,
    },

    #[error("message {token} was unroutable: {reason}")]
    Unroutable {
        token: CorrelationToken,
        reason: String,
    },

    #[error("job processing failed: {0}")]
    ProcessingFailure(String),

    #[error("notification failed: {0}")]
    NotificationFailure(String),

    #[error("reply for unknown correlation token {0}")]
    UnknownReplyToken(CorrelationToken),

    #[error("invalid work request: {0}")]
    InvalidRequest(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
