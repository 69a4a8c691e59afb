//! Broker port - メッセージブローカーの抽象化
//!
//! The connection manager only talks to these traits. A connector dials a
//! transport, the transport opens channels, and a channel does the actual
//! queue work. Implementations live in `impls` (AMQP, in-memory).
//!
//! # 設計原則
//! - one channel per connection is enough for this service
//! - `close` consumes the handle, a closed handle cannot be reused
//! - deliveries come back as a plain stream of [`Delivery`] values

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::domain::{BrokerError, Delivery};

/// Stream of deliveries for one consumer registration.
/// Ends when the channel or connection goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Where and how to dial the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub url: String,
    pub heartbeat: Duration,
}

impl BrokerEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: Duration::from_secs(10),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// Durable, shared, kept when the last consumer leaves.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// What the broker answered to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a new transport connection. One attempt, no retry.
    async fn dial(&self, endpoint: &BrokerEndpoint)
    -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;

    async fn close(self: Box<Self>) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue, BrokerError>;

    /// Publish a persistent message to `queue` through the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Maximum number of unacknowledged deliveries per consumer.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Register a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

    async fn close(self: Box<Self>) -> Result<(), BrokerError>;
}
