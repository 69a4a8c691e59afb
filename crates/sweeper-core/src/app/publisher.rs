//! Publisher - 削除リクエストの送信と consumer 登録
//!
//! Both operations reconnect once when the link is closed and fail without
//! touching the broker if that reconnect fails. The reconnect and the broker
//! call happen under one lock, so an idle release cannot slip in between.

use tokio::time::Instant;

use crate::app::connection::Client;
use crate::domain::{ClientError, ObjectId};
use crate::ports::DeliveryStream;

impl Client {
    /// Publish one persistent message to the queue.
    pub async fn publish(&self, payload: &[u8]) -> Result<(), ClientError> {
        let mut state = self.lock_connected().await?;
        let link = state.live_link().ok_or(ClientError::NotConnected)?;
        link.channel
            .publish(self.queue_name(), payload)
            .await
            .map_err(|source| ClientError::Publish {
                queue: self.queue_name().to_string(),
                source,
            })?;
        state.last_used = Instant::now();
        drop(state);
        self.inner.activity.notify_one();

        tracing::debug!(queue = %self.queue_name(), bytes = payload.len(), "message published");
        Ok(())
    }

    /// Ask the workers to delete `id`.
    pub async fn publish_delete(&self, id: &ObjectId) -> Result<(), ClientError> {
        self.publish(&id.to_payload()).await?;
        tracing::info!(queue = %self.queue_name(), object = %id, "delete request published");
        Ok(())
    }

    /// Set prefetch and register a manual-ack consumer on the queue.
    pub async fn start_consumer(&self) -> Result<DeliveryStream, ClientError> {
        let mut state = self.lock_connected().await?;
        let link = state.live_link().ok_or(ClientError::NotConnected)?;
        link.channel
            .set_prefetch(self.inner.config.prefetch)
            .await
            .map_err(ClientError::Qos)?;
        let stream = link
            .channel
            .consume(self.queue_name())
            .await
            .map_err(|source| ClientError::Consume {
                queue: self.queue_name().to_string(),
                source,
            })?;
        state.last_used = Instant::now();
        drop(state);
        self.inner.activity.notify_one();

        Ok(stream)
    }
}
