//! AMQP 0-9-1 adapter on top of `amqprs`.
//!
//! Messages go through the default exchange with the queue name as routing
//! key, marked persistent, content type `text/plain`.

use std::sync::atomic::{AtomicU64, Ordering};

use amqprs::callbacks::{DefaultChannelCallback, DefaultConnectionCallback};
use amqprs::channel::{
    BasicAckArguments, BasicConsumeArguments, BasicNackArguments, BasicPublishArguments,
    BasicQosArguments, Channel, QueueDeclareArguments,
};
use amqprs::connection::{Connection, OpenConnectionArguments};
use amqprs::BasicProperties;
use async_trait::async_trait;

use crate::domain::{Acknowledger, BrokerError, Delivery};
use crate::ports::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerEndpoint, DeclaredQueue,
    DeliveryStream, QueueSpec,
};

const PERSISTENT: u8 = 2;

static CONSUMER_SEQ: AtomicU64 = AtomicU64::new(0);

fn consumer_tag() -> String {
    let n = CONSUMER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("sweeper-{}-{}", std::process::id(), n)
}

/// Dials a RabbitMQ (or any AMQP 0-9-1) broker from an `amqp://` URI.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn dial(
        &self,
        endpoint: &BrokerEndpoint,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut args = OpenConnectionArguments::try_from(endpoint.url.as_str())
            .map_err(|e| BrokerError::Dial(e.to_string()))?;
        let heartbeat = u16::try_from(endpoint.heartbeat.as_secs()).unwrap_or(u16::MAX);
        args.heartbeat(heartbeat);

        let connection = Connection::open(&args)
            .await
            .map_err(|e| BrokerError::Dial(e.to_string()))?;
        connection
            .register_callback(DefaultConnectionCallback)
            .await
            .map_err(|e| BrokerError::Dial(e.to_string()))?;

        tracing::debug!(
            connection = %connection.connection_name(),
            heartbeat_secs = heartbeat,
            "amqp connection opened"
        );
        Ok(Box::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .open_channel(None)
            .await
            .map_err(|e| BrokerError::OpenChannel(e.to_string()))?;
        channel
            .register_callback(DefaultChannelCallback)
            .await
            .map_err(|e| BrokerError::OpenChannel(e.to_string()))?;
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        if !self.connection.is_open() {
            return Ok(());
        }
        self.connection
            .close()
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue, BrokerError> {
        let args = QueueDeclareArguments::new(&spec.name)
            .durable(spec.durable)
            .exclusive(spec.exclusive)
            .auto_delete(spec.auto_delete)
            .finish();
        let declared = self
            .channel
            .queue_declare(args)
            .await
            .map_err(|e| BrokerError::DeclareQueue {
                queue: spec.name.clone(),
                reason: e.to_string(),
            })?;

        // `None` only when declared with no_wait
        let (name, message_count, consumer_count) =
            declared.unwrap_or_else(|| (spec.name.clone(), 0, 0));
        Ok(DeclaredQueue {
            name,
            message_count,
            consumer_count,
        })
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type("text/plain")
            .with_delivery_mode(PERSISTENT)
            .finish();
        self.channel
            .basic_publish(
                properties,
                payload.to_vec(),
                BasicPublishArguments::new("", queue),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(BasicQosArguments::new(0, count, false))
            .await
            .map_err(|e| BrokerError::Qos(e.to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let args = BasicConsumeArguments::new(queue, &consumer_tag())
            .manual_ack(true)
            .finish();
        let (tag, rx) = self
            .channel
            .basic_consume_rx(args)
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;
        tracing::debug!(queue, consumer_tag = %tag, "amqp consumer registered");

        let channel = self.channel.clone();
        let stream = futures::stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                let message = rx.recv().await?;
                // deliver frames without a body are not something we can act on
                let (Some(deliver), Some(content)) = (message.deliver, message.content) else {
                    continue;
                };
                let acker = AmqpAcker {
                    channel: channel.clone(),
                    delivery_tag: deliver.delivery_tag(),
                };
                let delivery = Delivery::new(content, Box::new(acker))
                    .with_redelivered(deliver.redelivered());
                return Some((delivery, (rx, channel)));
            }
        });
        Ok(Box::pin(stream))
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        if !self.channel.is_open() {
            return Ok(());
        }
        self.channel
            .close()
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}

struct AmqpAcker {
    channel: Channel,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, multiple: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(BasicAckArguments::new(self.delivery_tag, multiple))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(BasicNackArguments::new(self.delivery_tag, multiple, requeue))
            .await
            .map_err(|e| BrokerError::Nack(e.to_string()))
    }
}
