//! InMemoryBroker - 開発・テスト用のブローカー
//!
//! # 学習ポイント
//! - Mutex で保護した共有状態 + mpsc によるプッシュ配送
//! - prefetch（未 ack 数の上限）と requeue のセマンティクス
//! - 障害注入（到達不能、dial 失敗、接続断）
//!
//! Behaves like a single-node AMQP broker for the parts this service uses:
//! durable queues on the default exchange, manual-ack consumers with
//! prefetch, requeue on nack, and redelivery of unacknowledged messages when
//! their channel goes away.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::{Acknowledger, BrokerError, Delivery};
use crate::ports::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerEndpoint, DeclaredQueue,
    DeliveryStream, QueueSpec,
};

/// Broker-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub dials: u64,
    pub published: u64,
    pub unroutable: u64,
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    pub discarded: u64,
}

/// Snapshot of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

/// In-memory broker. Cloning shares the same broker.
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new();
/// let client = Client::connect("memory://", "delete_image", Arc::new(broker.clone())).await?;
/// client.publish(b"uploads/abc.png").await?;
/// assert_eq!(broker.queue_stats("delete_image").unwrap().ready, 1);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    failing_dials: u32,
    failing_publishes: u32,
    failing_declares: u32,
    next_id: u64,
    connections: HashMap<u64, bool>,
    channels: HashMap<u64, ChannelEntry>,
    queues: HashMap<String, QueueState>,
    stats: BrokerStats,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
    prefetch: u16,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    /// Outstanding deliveries by delivery tag.
    unacked: BTreeMap<u64, Unacked>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

struct QueuedMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    body: Vec<u8>,
    channel: u64,
    consumer: u64,
}

struct Consumer {
    id: u64,
    channel: u64,
    prefetch: u16,
    inflight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.inflight < usize::from(self.prefetch)
    }
}

#[derive(Clone, Copy)]
enum Settle {
    Ack,
    Nack { requeue: bool },
}

fn lock(shared: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn connection_open(&self, connection: u64) -> bool {
        self.connections.get(&connection).copied().unwrap_or(false)
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|entry| entry.open && self.connection_open(entry.connection))
    }

    fn ensure_channel_open(&self, channel: u64) -> Result<(), BrokerError> {
        if self.channel_open(channel) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

/// Hand ready messages to consumers with spare prefetch, round-robin.
fn dispatch(shared: &Arc<Mutex<BrokerState>>, state: &mut BrokerState, queue: &str) {
    let BrokerState {
        queues,
        next_id,
        stats,
        ..
    } = state;
    let Some(q) = queues.get_mut(queue) else {
        return;
    };
    q.consumers.retain(|c| !c.tx.is_closed());

    while !q.ready.is_empty() {
        let n = q.consumers.len();
        let Some(i) = (0..n)
            .map(|offset| (q.cursor + offset) % n)
            .find(|&i| q.consumers[i].has_capacity())
        else {
            break;
        };
        let Some(message) = q.ready.pop_front() else {
            break;
        };
        q.cursor = (i + 1) % n;

        *next_id += 1;
        let tag = *next_id;
        let acker = InMemoryAcker {
            shared: Arc::clone(shared),
            queue: queue.to_string(),
            tag,
        };
        let delivery = Delivery::new(message.body.clone(), Box::new(acker))
            .with_redelivered(message.redelivered);

        if q.consumers[i].tx.send(delivery).is_err() {
            // consumer went away between retain and send
            q.ready.push_front(message);
            q.consumers.remove(i);
            continue;
        }

        let consumer = &mut q.consumers[i];
        consumer.inflight += 1;
        q.unacked.insert(
            tag,
            Unacked {
                body: message.body,
                channel: consumer.channel,
                consumer: consumer.id,
            },
        );
        stats.delivered += 1;
        if message.redelivered {
            stats.redelivered += 1;
        }
    }
}

/// Close a channel: drop its consumers and requeue what it still holds.
fn close_channel(shared: &Arc<Mutex<BrokerState>>, state: &mut BrokerState, channel: u64) {
    match state.channels.get_mut(&channel) {
        Some(entry) if entry.open => entry.open = false,
        _ => return,
    }

    let mut touched = Vec::new();
    for (name, q) in state.queues.iter_mut() {
        q.consumers.retain(|c| c.channel != channel);

        let tags: Vec<u64> = q
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        // reverse so the oldest delivery ends up first in line
        for tag in tags.iter().rev() {
            if let Some(u) = q.unacked.remove(tag) {
                q.ready.push_front(QueuedMessage {
                    body: u.body,
                    redelivered: true,
                });
                state.stats.requeued += 1;
            }
        }
        touched.push(name.clone());
    }

    for name in touched {
        dispatch(shared, state, &name);
    }
}

fn close_connection(shared: &Arc<Mutex<BrokerState>>, state: &mut BrokerState, connection: u64) {
    match state.connections.get_mut(&connection) {
        Some(open) if *open => *open = false,
        _ => return,
    }
    let channels: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, entry)| entry.connection == connection)
        .map(|(id, _)| *id)
        .collect();
    for channel in channels {
        close_channel(shared, state, channel);
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the broker host going down (`false`) or coming back (`true`).
    /// Existing connections are not affected, use [`kill_connections`](Self::kill_connections).
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.shared).unreachable = !reachable;
    }

    /// The next `n` dials fail.
    pub fn fail_next_dials(&self, n: u32) {
        lock(&self.shared).failing_dials = n;
    }

    /// The next `n` publishes are rejected.
    pub fn fail_next_publishes(&self, n: u32) {
        lock(&self.shared).failing_publishes = n;
    }

    /// The next `n` queue declarations fail. The channel stays open.
    pub fn fail_next_declares(&self, n: u32) {
        lock(&self.shared).failing_declares = n;
    }

    /// Drop every open connection, as a broker restart or network partition
    /// would. Unacknowledged deliveries go back to their queues.
    pub fn kill_connections(&self) {
        let mut state = lock(&self.shared);
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, open)| **open)
            .map(|(id, _)| *id)
            .collect();
        for connection in open {
            close_connection(&self.shared, &mut state, connection);
        }
    }

    /// Put a message on a queue directly, declaring the queue if needed.
    pub fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = lock(&self.shared);
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(QueuedMessage {
                body: body.into(),
                redelivered: false,
            });
        state.stats.published += 1;
        dispatch(&self.shared, &mut state, queue);
    }

    pub fn stats(&self) -> BrokerStats {
        lock(&self.shared).stats
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        let state = lock(&self.shared);
        state.queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            consumers: q.consumers.len(),
        })
    }

    /// Bodies waiting in `queue`, front first.
    pub fn ready_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = lock(&self.shared);
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.shared)
            .connections
            .values()
            .filter(|open| **open)
            .count()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn dial(
        &self,
        _endpoint: &BrokerEndpoint,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = lock(&self.shared);
        state.stats.dials += 1;
        if state.unreachable {
            return Err(BrokerError::Unreachable);
        }
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(BrokerError::Dial("injected dial failure".to_string()));
        }
        let id = state.allocate_id();
        state.connections.insert(id, true);
        Ok(Box::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }
}

struct InMemoryConnection {
    shared: Arc<Mutex<BrokerState>>,
    id: u64,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        lock(&self.shared).connection_open(self.id)
    }

    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let mut state = lock(&self.shared);
        if !state.connection_open(self.id) {
            return Err(BrokerError::OpenChannel("connection is closed".to_string()));
        }
        let id = state.allocate_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                open: true,
                prefetch: 0,
            },
        );
        Ok(Box::new(InMemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        let mut state = lock(&self.shared);
        close_connection(&self.shared, &mut state, self.id);
        Ok(())
    }
}

struct InMemoryChannel {
    shared: Arc<Mutex<BrokerState>>,
    id: u64,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        lock(&self.shared).channel_open(self.id)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclaredQueue, BrokerError> {
        let mut state = lock(&self.shared);
        state.ensure_channel_open(self.id)?;
        if state.failing_declares > 0 {
            state.failing_declares -= 1;
            return Err(BrokerError::DeclareQueue {
                queue: spec.name.clone(),
                reason: "injected declare failure".to_string(),
            });
        }
        let q = state.queues.entry(spec.name.clone()).or_default();
        Ok(DeclaredQueue {
            name: spec.name.clone(),
            message_count: q.ready.len() as u32,
            consumer_count: q.consumers.len() as u32,
        })
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let mut state = lock(&self.shared);
        state.ensure_channel_open(self.id)?;
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::Publish("injected publish failure".to_string()));
        }
        // default exchange + non-mandatory: unknown queue means the message is dropped
        let Some(q) = state.queues.get_mut(queue) else {
            state.stats.unroutable += 1;
            return Ok(());
        };
        q.ready.push_back(QueuedMessage {
            body: payload.to_vec(),
            redelivered: false,
        });
        state.stats.published += 1;
        dispatch(&self.shared, &mut state, queue);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let mut state = lock(&self.shared);
        state.ensure_channel_open(self.id)?;
        if let Some(entry) = state.channels.get_mut(&self.id) {
            entry.prefetch = count;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let mut state = lock(&self.shared);
        state.ensure_channel_open(self.id)?;
        let prefetch = state.channels.get(&self.id).map_or(0, |c| c.prefetch);
        let id = state.allocate_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(BrokerError::Consume(format!("no queue '{queue}'")));
        };
        q.consumers.push(Consumer {
            id,
            channel: self.id,
            prefetch,
            inflight: 0,
            tx,
        });
        dispatch(&self.shared, &mut state, queue);

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })))
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        let mut state = lock(&self.shared);
        close_channel(&self.shared, &mut state, self.id);
        Ok(())
    }
}

struct InMemoryAcker {
    shared: Arc<Mutex<BrokerState>>,
    queue: String,
    tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, multiple: bool, action: Settle) -> Result<(), BrokerError> {
        let mut guard = lock(&self.shared);
        let state = &mut *guard;

        let channel = state
            .queues
            .get(&self.queue)
            .and_then(|q| q.unacked.get(&self.tag))
            .map(|u| u.channel);
        let Some(channel) = channel.filter(|ch| state.channel_open(*ch)) else {
            let reason = format!("delivery tag {} is no longer outstanding", self.tag);
            return Err(match action {
                Settle::Ack => BrokerError::Ack(reason),
                Settle::Nack { .. } => BrokerError::Nack(reason),
            });
        };

        let BrokerState { queues, stats, .. } = &mut *state;
        let Some(q) = queues.get_mut(&self.queue) else {
            return Ok(());
        };
        let tags: Vec<u64> = if multiple {
            q.unacked
                .range(..=self.tag)
                .filter(|(_, u)| u.channel == channel)
                .map(|(tag, _)| *tag)
                .collect()
        } else {
            vec![self.tag]
        };

        let mut requeued = Vec::new();
        for tag in tags {
            let Some(u) = q.unacked.remove(&tag) else {
                continue;
            };
            if let Some(consumer) = q.consumers.iter_mut().find(|c| c.id == u.consumer) {
                consumer.inflight = consumer.inflight.saturating_sub(1);
            }
            match action {
                Settle::Ack => stats.acked += 1,
                Settle::Nack { requeue: true } => {
                    stats.nacked += 1;
                    stats.requeued += 1;
                    requeued.push(u.body);
                }
                Settle::Nack { requeue: false } => {
                    stats.nacked += 1;
                    stats.discarded += 1;
                }
            }
        }
        for body in requeued.into_iter().rev() {
            q.ready.push_front(QueuedMessage {
                body,
                redelivered: true,
            });
        }

        dispatch(&self.shared, state, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, multiple: bool) -> Result<(), BrokerError> {
        self.settle(multiple, Settle::Ack)
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), BrokerError> {
        self.settle(multiple, Settle::Nack { requeue })
    }
}
