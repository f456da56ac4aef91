// src/provider/memory/broker.rs

//! In-process push broker.
//!
//! Implements the event-driven adapter's [`BrokerConnector`] and
//! [`BrokerChannel`] seams with AMQP-like behavior:
//!
//! - queues hold ready messages until a consumer is registered;
//! - consumers on a queue receive deliveries round-robin, in order, one
//!   task per consumer;
//! - a delivery stays unacked until acked, or nacked with or without requeue;
//! - closing a channel (or [`MemoryBroker::disconnect_all`]) requeues its
//!   unacked deliveries and ends its consumers with the `None` sentinel.
//!
//! Brokers are cheap to clone; clones share the same queues. Tests keep a
//! clone to inspect counters and to simulate connection loss.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    //
    log_debug,
    log_info,
    QueueError,
    QueueName,
    Result,
};

use crate::provider::event_driven::{
    //
    BrokerChannel,
    BrokerConnector,
    CallbackPtr,
    ChannelPtr,
    DeliveryAcker,
    InboundDelivery,
    OutboundMessage,
};

/// Snapshot of broker activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections: u64,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    requeued: AtomicU64,
}

#[derive(Clone)]
struct StoredMessage {
    message_id: String,
    body: Bytes,
    headers: HashMap<String, String>,
    redelivered: bool,
}

struct Consumer {
    tag: String,
    channel_id: u64,
    active: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<InboundDelivery>,
}

struct Unacked {
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerQueue {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<QueueName, BrokerQueue>,
    channels: HashMap<u64, Arc<AtomicBool>>,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
struct BrokerShared {
    state: Mutex<BrokerState>,
    counters: Counters,
    refuse_connections: AtomicBool,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Hand ready messages of `queue` to its consumers, round-robin.
fn dispatch(shared: &Arc<BrokerShared>, state: &mut BrokerState, queue: &QueueName) {
    // ---
    loop {
        let delivery_tag = state.next_id();

        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        if q.consumers.is_empty() {
            return;
        }
        let Some(message) = q.ready.pop_front() else {
            return;
        };

        let index = q.next_consumer % q.consumers.len();
        q.next_consumer = index + 1;

        let consumer = &q.consumers[index];
        let channel_open = state
            .channels
            .get(&consumer.channel_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));

        let delivery = InboundDelivery {
            message_id: Some(message.message_id.clone()),
            body: message.body.clone(),
            headers: message.headers.clone(),
            redelivered: message.redelivered,
            acker: Box::new(MemoryAcker {
                shared: Arc::clone(shared),
                queue: queue.clone(),
                delivery_tag,
                channel_open,
            }),
        };

        if consumer.tx.send(delivery).is_err() {
            // Consumer task is gone; drop it and retry the message elsewhere.
            q.consumers.remove(index);
            q.ready.push_front(message);
            continue;
        }

        q.unacked.insert(
            delivery_tag,
            Unacked {
                channel_id: consumer.channel_id,
                message,
            },
        );
        shared.counters.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

/// Close one channel: stop its consumers and requeue what it left unacked.
fn close_channel_locked(shared: &Arc<BrokerShared>, state: &mut BrokerState, channel_id: u64) {
    // ---
    if let Some(open) = state.channels.remove(&channel_id) {
        open.store(false, Ordering::SeqCst);
    }

    let mut touched = Vec::new();

    for (name, q) in state.queues.iter_mut() {
        q.consumers.retain(|c| {
            if c.channel_id == channel_id {
                c.active.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });

        let orphaned: Vec<u64> = q
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();

        if orphaned.is_empty() {
            continue;
        }

        // Requeue in original delivery order, ahead of newer messages.
        let mut orphaned = orphaned;
        orphaned.sort_unstable();
        for tag in orphaned.into_iter().rev() {
            if let Some(mut unacked) = q.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                q.ready.push_front(unacked.message);
                shared.counters.requeued.fetch_add(1, Ordering::Relaxed);
            }
        }
        touched.push(name.clone());
    }

    for name in touched {
        dispatch(shared, state, &name);
    }
}

/// In-process AMQP-like broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<BrokerShared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters since creation.
    pub fn stats(&self) -> BrokerStats {
        // ---
        let c = &self.shared.counters;
        BrokerStats {
            connections: c.connections.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            nacked: c.nacked.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
        }
    }

    /// Messages waiting for a consumer.
    pub fn ready_count(&self, queue: &QueueName) -> usize {
        let state = lock_ignore_poison(&self.shared.state);
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &QueueName) -> usize {
        let state = lock_ignore_poison(&self.shared.state);
        state.queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &QueueName) -> usize {
        let state = lock_ignore_poison(&self.shared.state);
        state.queues.get(queue).map(|q| q.consumers.len()).unwrap_or(0)
    }

    /// True once `queue` has been declared.
    pub fn has_queue(&self, queue: &QueueName) -> bool {
        lock_ignore_poison(&self.shared.state).queues.contains_key(queue)
    }

    /// Drop every open channel as if the broker connection was lost.
    pub fn disconnect_all(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.shared.state);
        let channel_ids: Vec<u64> = state.channels.keys().copied().collect();

        for id in &channel_ids {
            close_channel_locked(&self.shared, &mut state, *id);
        }

        log_info!("memory broker: dropped {} channel(s)", channel_ids.len());
    }

    /// Make subsequent `connect` calls fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_connections.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl BrokerConnector for MemoryBroker {
    // ---
    fn broker_name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<ChannelPtr> {
        // ---
        if self.shared.refuse_connections.load(Ordering::SeqCst) {
            return Err(QueueError::Transport(
                "memory broker: connection refused".into(),
            ));
        }

        let open = Arc::new(AtomicBool::new(true));
        let id = {
            let mut state = lock_ignore_poison(&self.shared.state);
            let id = state.next_id();
            state.channels.insert(id, Arc::clone(&open));
            id
        };

        self.shared
            .counters
            .connections
            .fetch_add(1, Ordering::Relaxed);
        log_debug!("memory broker: opened channel {id}");

        Ok(Arc::new(MemoryChannel {
            id,
            shared: Arc::clone(&self.shared),
            open,
        }))
    }
}

struct MemoryChannel {
    id: u64,
    shared: Arc<BrokerShared>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Transport(format!(
                "memory broker: channel {} is closed",
                self.id
            )))
        }
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    // ---
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, queue: &QueueName) -> Result<()> {
        // ---
        self.ensure_open()?;
        lock_ignore_poison(&self.shared.state)
            .queues
            .entry(queue.clone())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> Result<()> {
        // ---
        self.ensure_open()?;

        let mut state = lock_ignore_poison(&self.shared.state);
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(QueueError::publish_failed(
                queue.as_str(),
                "no such queue",
            ));
        };

        q.ready.push_back(StoredMessage {
            message_id: message.message_id,
            body: message.body,
            headers: message.headers,
            redelivered: false,
        });
        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);

        dispatch(&self.shared, &mut state, queue);
        Ok(())
    }

    async fn consume(&self, queue: &QueueName, callback: CallbackPtr) -> Result<String> {
        // ---
        self.ensure_open()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<InboundDelivery>();
        let active = Arc::new(AtomicBool::new(true));

        let tag = {
            let mut state = lock_ignore_poison(&self.shared.state);
            let tag = format!("ctag-{}", state.next_id());

            let Some(q) = state.queues.get_mut(queue) else {
                return Err(QueueError::subscribe_failed(queue.as_str(), "no such queue"));
            };

            q.consumers.push(Consumer {
                tag: tag.clone(),
                channel_id: self.id,
                active: Arc::clone(&active),
                tx,
            });

            tag
        };

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if active.load(Ordering::SeqCst) {
                    callback.on_delivery(Some(delivery)).await;
                } else {
                    // Buffered for a consumer that no longer exists.
                    let _ = delivery.acker.nack(true).await;
                }
            }
            callback.on_delivery(None).await;
        });

        let mut state = lock_ignore_poison(&self.shared.state);
        dispatch(&self.shared, &mut state, queue);

        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        // ---
        self.ensure_open()?;

        let mut state = lock_ignore_poison(&self.shared.state);
        for q in state.queues.values_mut() {
            if let Some(pos) = q
                .consumers
                .iter()
                .position(|c| c.tag == consumer_tag && c.channel_id == self.id)
            {
                let consumer = q.consumers.remove(pos);
                consumer.active.store(false, Ordering::SeqCst);
                log_debug!("memory broker: cancelled {consumer_tag}");
                break;
            }
        }

        // Unknown tags are ignored, like a real broker.
        Ok(())
    }

    async fn close_channel(&self) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.shared.state);
        close_channel_locked(&self.shared, &mut state, self.id);
        Ok(())
    }

    async fn close_connection(&self) -> Result<()> {
        self.close_channel().await
    }
}

struct MemoryAcker {
    shared: Arc<BrokerShared>,
    queue: QueueName,
    delivery_tag: u64,
    channel_open: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn take(&self, state: &mut BrokerState) -> Result<StoredMessage> {
        // ---
        if !self.channel_open.load(Ordering::SeqCst) {
            return Err(QueueError::Transport(
                "memory broker: delivery channel is closed".into(),
            ));
        }

        state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.delivery_tag))
            .map(|u| u.message)
            .ok_or_else(|| {
                QueueError::Transport(format!(
                    "memory broker: unknown delivery tag {}",
                    self.delivery_tag
                ))
            })
    }
}

#[async_trait::async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.shared.state);
        self.take(&mut state)?;
        self.shared.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.shared.state);
        let mut message = self.take(&mut state)?;
        self.shared.counters.nacked.fetch_add(1, Ordering::Relaxed);

        if requeue {
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_front(message);
            }
            self.shared.counters.requeued.fetch_add(1, Ordering::Relaxed);
            dispatch(&self.shared, &mut state, &self.queue);
        }

        Ok(())
    }
}
