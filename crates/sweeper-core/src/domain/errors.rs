//! Errors - エラー型と分類
//!
//! Every broker failure carries the operation that failed, so callers can
//! tell a dial failure from a rejected publish without parsing strings.

use thiserror::Error;

/// Transport-level failure reported by a broker adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker is unreachable")]
    Unreachable,

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("failed to open channel: {0}")]
    OpenChannel(String),

    #[error("failed to declare queue {queue}: {reason}")]
    DeclareQueue { queue: String, reason: String },

    #[error("publish rejected: {0}")]
    Publish(String),

    #[error("failed to set prefetch: {0}")]
    Qos(String),

    #[error("failed to register consumer: {0}")]
    Consume(String),

    #[error("acknowledge failed: {0}")]
    Ack(String),

    #[error("negative acknowledge failed: {0}")]
    Nack(String),

    #[error("close failed: {0}")]
    Close(String),

    #[error("channel is closed")]
    ChannelClosed,
}

/// Errors surfaced by [`Client`](crate::app::Client) operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid client configuration: {0}")]
    Build(String),

    #[error("failed to connect to broker after {attempts} attempt(s)")]
    Connect {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("reconnection failed")]
    Reconnect(#[source] Box<ClientError>),

    /// The link was released between the liveness check and the operation.
    #[error("connection is not open")]
    NotConnected,

    #[error("failed to publish to queue {queue}")]
    Publish {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to configure prefetch")]
    Qos(#[source] BrokerError),

    #[error("failed to start consumer on queue {queue}")]
    Consume {
        queue: String,
        #[source]
        source: BrokerError,
    },
}

/// Failure of the remote object delete.
#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("delete of {id} failed: {reason}")]
    Remote { id: String, reason: String },

    #[error("{id} does not map to a valid storage location: {reason}")]
    InvalidLocation { id: String, reason: String },

    #[error("delete of {id} failed after {attempts} attempt(s)")]
    Exhausted {
        id: String,
        attempts: u32,
        #[source]
        last: Box<DeleteError>,
    },
}

/// The message body is not a usable object identifier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("object identifier is empty")]
    Empty,

    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("no object identifier found in url: {0}")]
    NoObjectInUrl(String),
}
