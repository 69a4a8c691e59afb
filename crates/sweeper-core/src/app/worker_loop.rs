//! DeleteWorker - 削除キューの消費ループ
//!
//! # 学習ポイント
//! - watch チャネルで停止要求と状態を伝える（Sender を drop しても停止）
//! - select! で「待つ」処理と停止要求を競合させる
//! - 受け取ったメッセージは必ず ack / nack してから次へ進む
//!
//! # フロー
//! 1. `Connecting`: link を確保し、prefetch を設定して consumer 登録
//! 2. `Consuming`: 1 件ずつ受け取り、リトライつきで削除
//! 3. 成功なら ack、リトライ切れなら requeue つき nack
//! 4. ストリームが終わったら `Disconnected` に戻って再登録
//! 5. 停止要求で `Draining` → 接続を閉じて `Stopped`

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::app::connection::Client;
use crate::domain::{ClientError, DeleteError, Delivery, ObjectId, RetryPolicy, WorkerState};
use crate::ports::{DeliveryStream, ObjectDeleter};

/// Default pause before trying to register the consumer again.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub delete_retry: RetryPolicy,
    pub reconnect_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            delete_retry: RetryPolicy::delete_default(),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
        }
    }
}

/// Consumes delete requests and removes the named objects.
pub struct DeleteWorker {
    client: Client,
    deleter: Arc<dyn ObjectDeleter>,
    config: WorkerConfig,
}

/// Handle to a spawned [`DeleteWorker`].
/// - `shutdown_tx` を drop するとワーカーが止まる
/// - `shutdown_and_join()` で終了を待てる
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<WorkerState>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to stop. An in-flight delivery is still settled.
    pub fn request_shutdown(&self) {
        // ignore send error: the worker may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    /// The worker closed its connection and exited.
    pub fn is_stopped(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    /// Wait until the worker reports `target`. Only the latest state is
    /// observed, so a state the worker passes through quickly can be missed.
    /// Returns `false` if the worker ended first.
    pub async fn wait_for_state(&self, target: WorkerState) -> bool {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|state| *state == target).await.is_ok()
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "delete worker task failed");
        }
    }
}

impl DeleteWorker {
    pub fn new(client: Client, deleter: Arc<dyn ObjectDeleter>) -> Self {
        Self {
            client,
            deleter,
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(WorkerState::Disconnected);
        let join = tokio::spawn(self.run(shutdown_rx, state_tx));
        WorkerHandle {
            shutdown_tx,
            state_rx,
            join,
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>, state_tx: watch::Sender<WorkerState>) {
        let queue = self.client.queue_name().to_string();
        tracing::info!(queue = %queue, "delete worker started");

        'outer: loop {
            if stop_requested(&shutdown_rx) {
                break;
            }
            set_state(&state_tx, WorkerState::Connecting);

            // 接続中でも停止要求を優先する
            let started = tokio::select! {
                biased;
                _ = wait_for_stop(&mut shutdown_rx) => break,
                started = self.connect_and_consume() => started,
            };
            let mut stream = match started {
                Ok(stream) => stream,
                Err(e) => {
                    set_state(&state_tx, WorkerState::Disconnected);
                    tracing::warn!(
                        queue = %queue,
                        error = %e,
                        backoff = ?self.config.reconnect_backoff,
                        "failed to start consumer, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = wait_for_stop(&mut shutdown_rx) => break,
                        _ = tokio::time::sleep(self.config.reconnect_backoff) => continue,
                    }
                }
            };

            set_state(&state_tx, WorkerState::Consuming);
            tracing::info!(queue = %queue, "waiting for delete requests");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = wait_for_stop(&mut shutdown_rx) => break 'outer,
                    next = stream.next() => next,
                };
                let Some(delivery) = next else {
                    break;
                };
                // 処理は select の外: 停止要求が来ても必ず決着させる
                self.handle(delivery).await;
            }

            set_state(&state_tx, WorkerState::Disconnected);
            tracing::warn!(queue = %queue, "delivery stream ended, restarting consumer");
        }

        set_state(&state_tx, WorkerState::Draining);
        self.client.close().await;
        set_state(&state_tx, WorkerState::Stopped);
        tracing::info!(queue = %queue, "delete worker stopped");
    }

    async fn connect_and_consume(&self) -> Result<DeliveryStream, ClientError> {
        if self.client.is_closed().await {
            self.client.reconnect().await?;
        }
        match self.client.start_consumer().await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.client.close().await;
                Err(e)
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        self.client.update_last_used().await;

        let id = match ObjectId::from_payload(delivery.body()) {
            Ok(id) => id,
            Err(e) => {
                // can never succeed, don't requeue
                tracing::warn!(error = %e, "dropping undecodable delete request");
                if let Err(e) = delivery.negative_acknowledge(false, false).await {
                    tracing::error!(error = %e, "failed to reject undecodable delete request");
                }
                return;
            }
        };
        tracing::info!(
            object = %id,
            redelivered = delivery.is_redelivered(),
            "received delete request"
        );

        match delete_with_retry(self.deleter.as_ref(), &id, &self.config.delete_retry).await {
            Ok(()) => match delivery.acknowledge(false).await {
                Ok(()) => tracing::info!(object = %id, "object deleted"),
                Err(e) => tracing::error!(object = %id, error = %e, "failed to acknowledge delete request"),
            },
            Err(e) => {
                tracing::error!(object = %id, error = %e, "giving up on delete, requeueing");
                if let Err(e) = delivery.negative_acknowledge(false, true).await {
                    tracing::error!(object = %id, error = %e, "failed to requeue delete request");
                }
            }
        }
    }
}

/// Call `delete_object` until it succeeds or the policy runs out.
/// There is no pause after the final attempt.
pub async fn delete_with_retry(
    deleter: &dyn ObjectDeleter,
    id: &ObjectId,
    policy: &RetryPolicy,
) -> Result<(), DeleteError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match deleter.delete_object(id).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(
                    object = %id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "delete attempt failed"
                );
                if !policy.allows_retry(attempt) {
                    return Err(DeleteError::Exhausted {
                        id: id.to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                tokio::time::sleep(policy.next_delay(attempt)).await;
            }
        }
    }
}

fn set_state(tx: &watch::Sender<WorkerState>, state: WorkerState) {
    tracing::debug!(state = %state, "worker state");
    tx.send_replace(state);
}

/// A dropped sender counts as a stop request.
fn stop_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which is also a stop
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ClientBuilder;
    use crate::domain::{Acknowledger, BrokerError};
    use crate::impls::InMemoryBroker;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    const QUEUE: &str = "delete_image";

    /// Fails the first `failures` calls, then succeeds. Records every call.
    struct FlakyDeleter {
        failures: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<(ObjectId, Instant)>>,
    }

    impl FlakyDeleter {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn call_times(&self) -> Vec<Instant> {
            self.seen.lock().unwrap().iter().map(|(_, at)| *at).collect()
        }
    }

    #[async_trait]
    impl ObjectDeleter for FlakyDeleter {
        async fn delete_object(&self, id: &ObjectId) -> Result<(), DeleteError> {
            self.seen.lock().unwrap().push((id.clone(), Instant::now()));
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(DeleteError::Remote {
                    id: id.to_string(),
                    reason: "503 service unavailable".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct RecordingAcker {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Acknowledger for RecordingAcker {
        async fn ack(&self, multiple: bool) -> Result<(), BrokerError> {
            self.log.lock().unwrap().push(format!("ack multiple={multiple}"));
            Ok(())
        }

        async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("nack multiple={multiple} requeue={requeue}"));
            Ok(())
        }
    }

    async fn client(broker: &InMemoryBroker) -> Client {
        ClientBuilder::new("memory://", QUEUE)
            .dial_policy(RetryPolicy::fixed(2, Duration::from_secs(1)))
            .idle_timeout(None)
            .connect(Arc::new(broker.clone()))
            .await
            .unwrap()
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            delete_retry: RetryPolicy::fixed(3, Duration::from_secs(2)),
            reconnect_backoff: Duration::from_secs(5),
        }
    }

    async fn settle(broker: &InMemoryBroker, expected_settled: u64) {
        for _ in 0..1000 {
            let stats = broker.stats();
            if stats.acked + stats.nacked >= expected_settled {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("deliveries were not settled: {:?}", broker.stats());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_before_exhaustion() {
        let deleter = FlakyDeleter::new(2);
        let id = ObjectId::new("uploads/a.png").unwrap();

        delete_with_retry(deleter.as_ref(), &id, &RetryPolicy::fixed(3, Duration::from_secs(2)))
            .await
            .unwrap();

        assert_eq!(deleter.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_has_no_trailing_sleep() {
        let deleter = FlakyDeleter::new(u32::MAX);
        let id = ObjectId::new("uploads/a.png").unwrap();
        let started = Instant::now();

        let err = delete_with_retry(deleter.as_ref(), &id, &RetryPolicy::fixed(3, Duration::from_secs(2)))
            .await
            .unwrap_err();

        assert!(matches!(err, DeleteError::Exhausted { attempts: 3, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        let times = deleter.call_times();
        assert_eq!(times[1] - times[0], Duration::from_secs(2));
        assert_eq!(times[2] - times[1], Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn long_exponential_retry_is_capped() {
        let deleter = FlakyDeleter::new(u32::MAX);
        let id = ObjectId::new("uploads/a.png").unwrap();
        let policy = RetryPolicy::exponential(2000, Duration::from_secs(1), 2.0);
        let started = Instant::now();

        let err = delete_with_retry(deleter.as_ref(), &id, &policy).await.unwrap_err();

        assert!(matches!(err, DeleteError::Exhausted { attempts: 2000, .. }));
        assert_eq!(deleter.calls(), 2000);
        // 1 + 2 + .. + 2048, then 1987 pauses at the one hour cap
        let expected = 4095 + 1987 * crate::domain::policy::MAX_DELAY.as_secs();
        assert_eq!(started.elapsed(), Duration::from_secs(expected));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_end_in_a_single_ack() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let deleter = FlakyDeleter::new(2);
        let worker = DeleteWorker::new(client.clone(), deleter.clone()).with_config(config());

        let log = Arc::new(Mutex::new(Vec::new()));
        let delivery = Delivery::new(
            b"uploads/a.png".to_vec(),
            Box::new(RecordingAcker { log: log.clone() }),
        );
        worker.handle(delivery).await;

        assert_eq!(deleter.calls(), 3);
        assert_eq!(*log.lock().unwrap(), vec!["ack multiple=false".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_delete_is_nacked_with_requeue() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let deleter = FlakyDeleter::new(u32::MAX);
        let worker = DeleteWorker::new(client.clone(), deleter.clone()).with_config(config());

        let log = Arc::new(Mutex::new(Vec::new()));
        let delivery = Delivery::new(
            b"uploads/a.png".to_vec(),
            Box::new(RecordingAcker { log: log.clone() }),
        );
        worker.handle(delivery).await;

        assert_eq!(deleter.calls(), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["nack multiple=false requeue=true".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_payload_is_dropped() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let deleter = FlakyDeleter::new(0);
        let worker = DeleteWorker::new(client.clone(), deleter.clone()).with_config(config());

        let log = Arc::new(Mutex::new(Vec::new()));
        let delivery = Delivery::new(vec![0xff, 0xfe], Box::new(RecordingAcker { log: log.clone() }));
        worker.handle(delivery).await;

        assert_eq!(deleter.calls(), 0);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["nack multiple=false requeue=false".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_and_acks_published_requests() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let deleter = FlakyDeleter::new(0);
        let handle = DeleteWorker::new(client.clone(), deleter.clone())
            .with_config(config())
            .spawn();

        for name in ["uploads/a.png", "uploads/b.jpg"] {
            client.publish_delete(&ObjectId::new(name).unwrap()).await.unwrap();
        }
        settle(&broker, 2).await;

        assert_eq!(broker.stats().acked, 2);
        assert_eq!(broker.stats().nacked, 0);
        assert_eq!(broker.queue_stats(QUEUE).unwrap().ready, 0);
        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_message_is_redelivered_and_eventually_acked() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        // first delivery burns all 3 attempts, the redelivery succeeds
        let deleter = FlakyDeleter::new(3);
        let handle = DeleteWorker::new(client.clone(), deleter.clone())
            .with_config(config())
            .spawn();

        client.publish(b"uploads/stubborn.png").await.unwrap();
        settle(&broker, 2).await;

        let stats = broker.stats();
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.redelivered, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(deleter.calls(), 4);
        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn worker_recovers_after_broker_restart() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let deleter = FlakyDeleter::new(0);
        let handle = DeleteWorker::new(client.clone(), deleter.clone())
            .with_config(config())
            .spawn();
        assert!(handle.wait_for_state(WorkerState::Consuming).await);

        broker.kill_connections();
        broker.enqueue(QUEUE, "uploads/after-restart.png");
        settle(&broker, 1).await;

        assert_eq!(broker.stats().acked, 1);
        assert_eq!(broker.stats().dials, 2);
        assert_eq!(handle.state(), WorkerState::Consuming);
        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn worker_backs_off_while_broker_is_down() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let handle = DeleteWorker::new(client.clone(), FlakyDeleter::new(0))
            .with_config(config())
            .spawn();
        assert!(handle.wait_for_state(WorkerState::Consuming).await);

        broker.set_reachable(false);
        broker.kill_connections();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_ne!(handle.state(), WorkerState::Consuming);
        assert!(!handle.is_stopped());

        broker.set_reachable(true);
        assert!(handle.wait_for_state(WorkerState::Consuming).await);
        handle.shutdown_and_join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_while_connecting_stops_dialing() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let handle = DeleteWorker::new(client.clone(), FlakyDeleter::new(0))
            .with_config(config())
            .spawn();
        assert!(handle.wait_for_state(WorkerState::Consuming).await);

        broker.set_reachable(false);
        broker.kill_connections();
        // first redial failed, the 1s dial pause is running
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(handle.state(), WorkerState::Connecting);
        assert_eq!(broker.stats().dials, 2);

        let states = handle.subscribe();
        handle.shutdown_and_join().await;

        assert_eq!(*states.borrow(), WorkerState::Stopped);
        assert_eq!(broker.queue_stats(QUEUE).unwrap().consumers, 0);
        assert_eq!(broker.stats().dials, 2);

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.stats().dials, 2);
        assert_eq!(broker.queue_stats(QUEUE).unwrap().consumers, 0);
        assert!(client.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_stops_dialing() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let handle = DeleteWorker::new(client.clone(), FlakyDeleter::new(0))
            .with_config(config())
            .spawn();
        assert!(handle.wait_for_state(WorkerState::Consuming).await);

        broker.set_reachable(false);
        broker.kill_connections();
        // both dial attempts failed at +0s and +1s, backoff runs until +6s
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(handle.state(), WorkerState::Disconnected);
        assert_eq!(broker.stats().dials, 3);

        let started = Instant::now();
        let states = handle.subscribe();
        handle.shutdown_and_join().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(*states.borrow(), WorkerState::Stopped);
        assert_eq!(broker.queue_stats(QUEUE).unwrap().consumers, 0);

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.stats().dials, 3);
        assert_eq!(broker.queue_stats(QUEUE).unwrap().consumers, 0);
        assert!(client.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_the_connection() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let handle = DeleteWorker::new(client.clone(), FlakyDeleter::new(0))
            .with_config(config())
            .spawn();
        assert!(handle.wait_for_state(WorkerState::Consuming).await);

        let mut states = handle.subscribe();
        handle.shutdown_and_join().await;

        assert_eq!(*states.borrow_and_update(), WorkerState::Stopped);
        assert!(states.borrow().is_terminal());
        assert!(client.is_closed().await);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_worker() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        let handle = DeleteWorker::new(client.clone(), FlakyDeleter::new(0))
            .with_config(config())
            .spawn();
        assert!(handle.wait_for_state(WorkerState::Consuming).await);

        let mut states = handle.subscribe();
        drop(handle);
        states
            .wait_for(|state| *state == WorkerState::Stopped)
            .await
            .unwrap();

        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_delivery_is_settled_before_draining() {
        let broker = InMemoryBroker::new();
        let client = client(&broker).await;
        // one failure keeps the delivery in flight across a 2s retry pause
        let deleter = FlakyDeleter::new(1);
        let handle = DeleteWorker::new(client.clone(), deleter.clone())
            .with_config(config())
            .spawn();
        assert!(handle.wait_for_state(WorkerState::Consuming).await);

        client.publish(b"uploads/slow.png").await.unwrap();
        while deleter.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown_and_join().await;

        assert_eq!(deleter.calls(), 2);
        assert_eq!(broker.stats().acked, 1);
        assert_eq!(broker.queue_stats(QUEUE).unwrap().ready, 0);
    }
}
