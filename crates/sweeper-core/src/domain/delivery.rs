//! Delivery - ブローカーから受け取ったメッセージ
//!
//! A delivery carries its own settlement capability. The worker never sees a
//! broker-specific type: adapters implement [`Acknowledger`] and hand it over
//! together with the body.

use std::fmt;

use async_trait::async_trait;

use super::errors::BrokerError;

/// Settles one delivery on the broker that produced it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Confirm processing; the broker forgets the message.
    async fn ack(&self, multiple: bool) -> Result<(), BrokerError>;

    /// Reject processing. With `requeue` the broker makes the message
    /// available again, otherwise it is dropped (or dead-lettered).
    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError>;
}

/// A message borrowed from the broker until it is settled.
///
/// Settling consumes the delivery, so it can be acked or nacked at most once.
pub struct Delivery {
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            redelivered: false,
            acker,
        }
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The broker already handed this message out at least once.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn acknowledge(self, multiple: bool) -> Result<(), BrokerError> {
        self.acker.ack(multiple).await
    }

    pub async fn negative_acknowledge(
        self,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        self.acker.nack(multiple, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body", &String::from_utf8_lossy(&self.body))
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}
