//! Idle monitor - 使われていない接続の解放
//!
//! One task per client. It sleeps until `last_used + timeout`; every bit of
//! activity wakes it through the client's `Notify` so the deadline is
//! recomputed. Holding only a `Weak` reference, it ends when the last
//! `Client` clone is dropped (the `CancellationToken` fires from `Drop`).

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::app::connection::ClientInner;

/// Wake just after the window so the link has been idle strictly longer.
const PAST_DEADLINE: Duration = Duration::from_millis(1);

pub(crate) fn spawn(inner: &Arc<ClientInner>, timeout: Duration) {
    let client = Arc::downgrade(inner);
    let activity = Arc::clone(&inner.activity);
    let cancel = inner.shutdown.clone();
    tokio::spawn(run(client, activity, cancel, timeout));
}

async fn run(
    client: Weak<ClientInner>,
    activity: Arc<Notify>,
    cancel: CancellationToken,
    timeout: Duration,
) {
    loop {
        let Some(deadline) = next_deadline(&client, timeout).await else {
            break;
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = activity.notified() => continue,
            _ = sleep_until(deadline) => {}
        }

        let Some(inner) = client.upgrade() else {
            break;
        };
        let released = {
            let mut state = inner.state.lock().await;
            let idle = state.last_used.elapsed();
            if idle > timeout {
                state.link.take().map(|link| (link, idle))
            } else {
                None
            }
        };
        if let Some((link, idle)) = released {
            tracing::info!(
                queue = %inner.config.queue.name,
                idle_secs = idle.as_secs(),
                "releasing idle broker connection"
            );
            link.shutdown().await;
        }
    }
    tracing::debug!("idle monitor stopped");
}

/// `None` once the client is gone. `Some(None)` means nothing to watch until
/// the next activity.
async fn next_deadline(client: &Weak<ClientInner>, timeout: Duration) -> Option<Option<Instant>> {
    let inner = client.upgrade()?;
    let state = inner.state.lock().await;
    let deadline = state
        .live_link()
        .map(|_| state.last_used + timeout + PAST_DEADLINE);
    drop(state);
    Some(deadline)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
