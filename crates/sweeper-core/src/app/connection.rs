//! Client - ブローカー接続の管理
//!
//! # 学習ポイント
//! - 接続・チャネル・キュー宣言を 1 つの `Link` としてまとめて扱う
//! - 1 つの Mutex で link と last_used を保護し、再接続を直列化する
//! - 古い link は新しい link が使えるようになってから閉じる
//!
//! A `Client` is cheap to clone; every clone talks through the same link.
//! The link is created eagerly by [`Client::connect`], can disappear at any
//! time (broker restart, idle release, explicit close) and is re-created on
//! demand by [`Client::reconnect`].

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::app::builder::{ClientBuilder, ClientConfig};
use crate::app::idle_monitor;
use crate::domain::{BrokerError, ClientError};
use crate::ports::{BrokerChannel, BrokerConnection, BrokerConnector, DeclaredQueue};

/// Connection + channel + declared queue, opened and dropped together.
pub(crate) struct Link {
    pub(crate) connection: Box<dyn BrokerConnection>,
    pub(crate) channel: Box<dyn BrokerChannel>,
    pub(crate) queue: DeclaredQueue,
}

impl Link {
    pub(crate) fn is_live(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }

    /// Close channel, then connection. Errors are logged, not returned.
    pub(crate) async fn shutdown(self) {
        let queue = self.queue.name;
        if let Err(e) = self.channel.close().await {
            tracing::warn!(queue = %queue, error = %e, "failed to close channel");
        }
        if let Err(e) = self.connection.close().await {
            tracing::warn!(queue = %queue, error = %e, "failed to close connection");
        }
    }
}

pub(crate) struct ConnectionState {
    pub(crate) link: Option<Link>,
    pub(crate) last_used: Instant,
}

impl ConnectionState {
    /// The link, if it is present and both handles are open.
    pub(crate) fn live_link(&self) -> Option<&Link> {
        self.link.as_ref().filter(|link| link.is_live())
    }
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    connector: Arc<dyn BrokerConnector>,
    pub(crate) state: Mutex<ConnectionState>,
    /// Wakes the idle monitor whenever `last_used` or the link changes.
    pub(crate) activity: Arc<Notify>,
    pub(crate) shutdown: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Resilient handle to one durable queue.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Connect with default settings (5 dial attempts 5s apart, 5 minute
    /// idle release, prefetch 1).
    pub async fn connect(
        url: impl Into<String>,
        queue: impl Into<String>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, ClientError> {
        ClientBuilder::new(url, queue).connect(connector).await
    }

    pub(crate) async fn with_config(
        config: ClientConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, ClientError> {
        let link = establish(&config, connector.as_ref()).await?;
        let idle_timeout = config.idle_timeout;
        let inner = Arc::new(ClientInner {
            config,
            connector,
            state: Mutex::new(ConnectionState {
                link: Some(link),
                last_used: Instant::now(),
            }),
            activity: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
        });
        if let Some(timeout) = idle_timeout {
            idle_monitor::spawn(&inner, timeout);
        }
        Ok(Self { inner })
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.config.queue.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// No link, or the connection or channel reports closed.
    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.live_link().is_none()
    }

    /// Re-establish the link if it is not live.
    ///
    /// The lock is held for the whole operation, so concurrent callers
    /// serialize: the first one dials, the others find a live link and
    /// return without dialing.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let mut state = self.inner.state.lock().await;
        if state.live_link().is_some() {
            return Ok(());
        }
        self.relink(&mut state).await
    }

    /// Lock the connection state with a live link in it, re-establishing the
    /// link first if needed. Nothing else can release the link while the
    /// guard is held.
    pub(crate) async fn lock_connected(&self) -> Result<MutexGuard<'_, ConnectionState>, ClientError> {
        let mut state = self.inner.state.lock().await;
        if state.live_link().is_none() {
            self.relink(&mut state)
                .await
                .map_err(|e| ClientError::Reconnect(Box::new(e)))?;
        }
        Ok(state)
    }

    /// Establish a new link and swap it in. The caller holds the lock.
    async fn relink(&self, state: &mut ConnectionState) -> Result<(), ClientError> {
        tracing::info!(queue = %self.queue_name(), "reconnecting to broker");
        let link = establish(&self.inner.config, self.inner.connector.as_ref()).await?;
        let stale = state.link.replace(link);
        state.last_used = Instant::now();
        self.inner.activity.notify_one();

        if let Some(stale) = stale {
            stale.shutdown().await;
        }
        Ok(())
    }

    /// Restart the idle window.
    pub async fn update_last_used(&self) {
        self.inner.state.lock().await.last_used = Instant::now();
        self.inner.activity.notify_one();
    }

    /// Close channel and connection. Calling it on a closed client is a no-op.
    pub async fn close(&self) {
        let link = self.inner.state.lock().await.link.take();
        if let Some(link) = link {
            link.shutdown().await;
            tracing::info!(queue = %self.queue_name(), "broker connection closed");
        }
        self.inner.activity.notify_one();
    }
}

/// Dial, open a channel, declare the queue; retried as one unit.
async fn establish(
    config: &ClientConfig,
    connector: &dyn BrokerConnector,
) -> Result<Link, ClientError> {
    let policy = &config.dial_policy;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match open_link(config, connector).await {
            Ok(link) => {
                tracing::info!(
                    queue = %link.queue.name,
                    messages = link.queue.message_count,
                    consumers = link.queue.consumer_count,
                    attempt,
                    "connected to broker"
                );
                return Ok(link);
            }
            Err(e) => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "broker connection attempt failed"
                );
                if !policy.allows_retry(attempt) {
                    return Err(ClientError::Connect {
                        attempts: attempt,
                        source: e,
                    });
                }
                tokio::time::sleep(policy.next_delay(attempt)).await;
            }
        }
    }
}

async fn open_link(
    config: &ClientConfig,
    connector: &dyn BrokerConnector,
) -> Result<Link, BrokerError> {
    let connection = connector.dial(&config.endpoint).await?;

    let channel = match connection.open_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            if let Err(close) = connection.close().await {
                tracing::warn!(
                    error = %close,
                    "failed to close connection after channel open failed"
                );
            }
            return Err(e);
        }
    };

    match channel.declare_queue(&config.queue).await {
        Ok(queue) => Ok(Link {
            connection,
            channel,
            queue,
        }),
        Err(e) => {
            if let Err(close) = channel.close().await {
                tracing::warn!(
                    queue = %config.queue.name,
                    error = %close,
                    "failed to close channel after declare failed"
                );
            }
            if let Err(close) = connection.close().await {
                tracing::warn!(
                    queue = %config.queue.name,
                    error = %close,
                    "failed to close connection after declare failed"
                );
            }
            Err(e)
        }
    }
}
