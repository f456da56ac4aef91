//! Event-driven provider adapter (broker style).
//!
//! Models a backend with a persistent connection, one shared channel, and
//! explicit per-message acknowledgment. The broker pushes deliveries to a
//! registered consumer; nothing polls.
//!
//! ## Connection model
//!
//! The connection is an explicit state machine:
//!
//! ```text
//! Disconnected ──op──▶ Connecting ──ok──▶ Connected
//!       ▲                   │                 │
//!       └──────── err ──────┘◀── channel lost ┘ (noticed by the next op)
//! ```
//!
//! Any operation that needs the channel checks the state first. `Connected`
//! with an open channel is used directly; `Connecting` is awaited (the
//! in-flight attempt is shared, never duplicated); `Disconnected` or a closed
//! channel starts a new attempt. Nothing reconnects in the background.
//!
//! Every registered consumer keeps its handler. Each established channel gets
//! a new epoch, and the first operation on a new channel re-declares and
//! re-consumes every queue whose consumer belongs to an older epoch, so
//! subscriptions survive a channel loss once the connection is back.
//!
//! ## Delivery semantics
//!
//! - One consumer registration (tag) per queue, on the shared channel.
//!   Subscribing again cancels the old consumer before registering the new one.
//! - A `None` delivery is the broker telling us the consumer was cancelled;
//!   it is not a message. When the channel was lost, the consumer is
//!   registered again on the next channel.
//! - Handler success acks the delivery; failure nacks it with requeue. There
//!   is no adapter-level retry cap.
//!
//! Concrete brokers plug in through [`BrokerConnector`] and [`BrokerChannel`].

#[cfg(feature = "provider_lapin")]
pub(crate) mod lapin;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    HandlerOutcome,
    HandlerPtr,
    QueueError,
    QueueMessage,
    QueueName,
    QueueProvider,
    Result,
};

/// A message on its way to the broker.
///
/// Adapters publish it persistent; `headers` carry the flat attribute map.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_id: String,
    pub body: Bytes,
    pub headers: HashMap<String, String>,
}

/// Settles one delivery with the broker.
#[async_trait::async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message pushed by the broker, with headers already decoded to strings.
pub struct InboundDelivery {
    pub message_id: Option<String>,
    pub body: Bytes,
    pub headers: HashMap<String, String>,
    pub redelivered: bool,
    pub acker: Box<dyn DeliveryAcker>,
}

/// Per-consumer callback driven by the channel.
#[async_trait::async_trait]
pub trait DeliveryCallback: Send + Sync {
    /// `None` signals that the broker cancelled the consumer.
    async fn on_delivery(&self, delivery: Option<InboundDelivery>);
}

/// Shared delivery callback pointer.
pub type CallbackPtr = Arc<dyn DeliveryCallback>;

/// One open broker channel (and the connection it lives on).
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    // ---
    /// False once the channel or its connection has been lost or closed.
    fn is_open(&self) -> bool;

    /// Idempotent durable queue declaration.
    async fn declare_queue(&self, queue: &QueueName) -> Result<()>;

    /// Enqueue a persistent message. A broker-side rejection is an error.
    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> Result<()>;

    /// Register a manual-ack consumer and return its tag.
    async fn consume(&self, queue: &QueueName, callback: CallbackPtr) -> Result<String>;

    /// Cancel a consumer by tag.
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close_channel(&self) -> Result<()>;

    async fn close_connection(&self) -> Result<()>;
}

/// Shared channel pointer.
pub type ChannelPtr = Arc<dyn BrokerChannel>;

/// Opens a connection and one channel on it.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    fn broker_name(&self) -> &'static str;

    async fn connect(&self) -> Result<ChannelPtr>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn BrokerConnector>;

type ConnectFuture = Shared<BoxFuture<'static, std::result::Result<ChannelPtr, String>>>;

/// Connection state of an [`EventDrivenProvider`].
enum ConnectionState {
    Disconnected,
    Connecting(ConnectFuture),
    Connected(ChannelPtr, u64),
}

/// A queue's consumer registration.
struct Consumer {
    tag: String,
    handler: HandlerPtr,

    /// Channel the tag was issued on, and that channel's epoch.
    channel: ChannelPtr,
    epoch: u64,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Event-driven implementation of the `QueueProvider` facade.
pub struct EventDrivenProvider {
    // ---
    provider_id: String,
    connector: ConnectorPtr,
    state: Mutex<ConnectionState>,
    declared: Mutex<HashSet<QueueName>>,
    consumers: AsyncMutex<HashMap<QueueName, Consumer>>,
    epoch: AtomicU64,
    restore_pending: AtomicBool,
    closed: AtomicBool,
}

impl EventDrivenProvider {
    /// Create a provider. No connection is opened until [`connect`](Self::connect)
    /// or the first operation.
    pub fn new(provider_id: impl Into<String>, connector: ConnectorPtr) -> Self {
        // ---
        Self {
            provider_id: provider_id.into(),
            connector,
            state: Mutex::new(ConnectionState::Disconnected),
            declared: Mutex::new(HashSet::new()),
            consumers: AsyncMutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            restore_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Open the connection eagerly (process start).
    pub async fn connect(&self) -> Result<()> {
        self.channel().await.map(|_| ())
    }

    /// True when a channel is established and open.
    pub fn is_connected(&self) -> bool {
        matches!(
            &*lock_ignore_poison(&self.state),
            ConnectionState::Connected(ch, _) if ch.is_open()
        )
    }

    /// Consumer tag registered for `queue`, if any.
    pub async fn consumer_tag(&self, queue: &QueueName) -> Option<String> {
        self.consumers.lock().await.get(queue).map(|c| c.tag.clone())
    }

    fn callback(&self, queue: &QueueName, handler: HandlerPtr) -> CallbackPtr {
        Arc::new(ConsumerCallback {
            provider_id: self.provider_id.clone(),
            queue: queue.clone(),
            handler,
        })
    }

    fn start_connect(&self) -> ConnectFuture {
        // ---
        let connector = Arc::clone(&self.connector);
        let provider_id = self.provider_id.clone();

        async move {
            log_info!("[{provider_id}] connecting to {}", connector.broker_name());
            connector.connect().await.map_err(|e| {
                log_error!("[{provider_id}] connection failed: {e}");
                e.to_string()
            })
        }
        .boxed()
        .shared()
    }

    /// Current channel, (re)connecting if absent. Single-flight.
    ///
    /// Consumers left on an older channel are restored before it returns.
    async fn channel(&self) -> Result<ChannelPtr> {
        self.session().await.map(|(channel, _)| channel)
    }

    /// Like [`channel`](Self::channel), with the channel's epoch.
    async fn session(&self) -> Result<(ChannelPtr, u64)> {
        // ---
        let (channel, epoch) = self.current_channel().await?;

        if self.restore_pending.swap(false, Ordering::SeqCst) {
            self.restore_consumers(&channel, epoch).await;
        }

        Ok((channel, epoch))
    }

    async fn current_channel(&self) -> Result<(ChannelPtr, u64)> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("provider is closed".into()));
        }

        let connecting = {
            let mut state = lock_ignore_poison(&self.state);

            if let ConnectionState::Connected(channel, epoch) = &*state {
                if channel.is_open() {
                    return Ok((Arc::clone(channel), *epoch));
                }
                log_warn!("[{}] channel lost, reconnecting", self.provider_id);
            }

            if let ConnectionState::Connecting(pending) = &*state {
                pending.clone()
            } else {
                let pending = self.start_connect();
                *state = ConnectionState::Connecting(pending.clone());
                pending
            }
        };

        let outcome = connecting.await;

        let mut state = lock_ignore_poison(&self.state);
        let still_connecting = matches!(&*state, ConnectionState::Connecting(_));

        match outcome {
            Ok(channel) => {
                if still_connecting {
                    let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    *state = ConnectionState::Connected(Arc::clone(&channel), epoch);
                    lock_ignore_poison(&self.declared).clear();
                    self.restore_pending.store(true, Ordering::SeqCst);
                    log_info!("[{}] channel established (epoch {epoch})", self.provider_id);
                    return Ok((channel, epoch));
                }
                // Someone else installed the result; report what is current.
                match &*state {
                    ConnectionState::Connected(current, epoch) => Ok((Arc::clone(current), *epoch)),
                    _ => Ok((channel, self.epoch.load(Ordering::SeqCst))),
                }
            }
            Err(e) => {
                if still_connecting {
                    *state = ConnectionState::Disconnected;
                }
                Err(QueueError::Transport(e))
            }
        }
    }

    /// Register again every consumer whose tag died with an older channel.
    ///
    /// Failures are logged and retried on the next operation.
    async fn restore_consumers(&self, channel: &ChannelPtr, epoch: u64) {
        // ---
        let mut consumers = self.consumers.lock().await;
        let mut failed = false;

        for (queue, consumer) in consumers.iter_mut() {
            if consumer.epoch == epoch {
                continue;
            }

            let restored = match self.ensure_declared(channel, queue).await {
                Ok(()) => channel.consume(queue, self.callback(queue, Arc::clone(&consumer.handler))).await,
                Err(e) => Err(e),
            };

            match restored {
                Ok(tag) => {
                    log_info!(
                        "[{}] restored consumer on {queue} as {tag} (was {})",
                        self.provider_id,
                        consumer.tag
                    );
                    consumer.tag = tag;
                    consumer.channel = Arc::clone(channel);
                    consumer.epoch = epoch;
                }
                Err(e) => {
                    log_error!("[{}] restoring consumer on {queue} failed: {e}", self.provider_id);
                    failed = true;
                }
            }
        }

        if failed {
            self.restore_pending.store(true, Ordering::SeqCst);
        }
    }

    async fn ensure_declared(&self, channel: &ChannelPtr, queue: &QueueName) -> Result<()> {
        // ---
        if lock_ignore_poison(&self.declared).contains(queue) {
            return Ok(());
        }

        channel.declare_queue(queue).await?;
        lock_ignore_poison(&self.declared).insert(queue.clone());
        log_debug!("[{}] declared queue {queue}", self.provider_id);
        Ok(())
    }
}

/// Bridges broker deliveries to a [`MessageHandler`](crate::MessageHandler).
struct ConsumerCallback {
    provider_id: String,
    queue: QueueName,
    handler: HandlerPtr,
}

#[async_trait::async_trait]
impl DeliveryCallback for ConsumerCallback {
    async fn on_delivery(&self, delivery: Option<InboundDelivery>) {
        // ---
        let Some(delivery) = delivery else {
            log_info!(
                "[{}] consumer for {} ended by broker",
                self.provider_id,
                self.queue
            );
            return;
        };

        let message = QueueMessage {
            id: delivery.message_id,
            body: String::from_utf8_lossy(&delivery.body).into_owned(),
            attributes: if delivery.headers.is_empty() {
                None
            } else {
                Some(delivery.headers)
            },
        };
        let message_id = message.id.clone().unwrap_or_default();

        match self.handler.handle(&self.queue, message).await {
            HandlerOutcome::Success => {
                if let Err(e) = delivery.acker.ack().await {
                    log_error!(
                        "[{}] ack of {message_id} on {} failed: {e}",
                        self.provider_id,
                        self.queue
                    );
                }
            }
            HandlerOutcome::Failure(reason) => {
                log_warn!(
                    "[{}] handler failed for {message_id} on {}, requeueing: {reason}",
                    self.provider_id,
                    self.queue
                );
                if let Err(e) = delivery.acker.nack(true).await {
                    log_error!(
                        "[{}] nack of {message_id} on {} failed: {e}",
                        self.provider_id,
                        self.queue
                    );
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl QueueProvider for EventDrivenProvider {
    // ---
    fn provider_name(&self) -> &'static str {
        self.connector.broker_name()
    }

    async fn publish(&self, queue: &QueueName, message: QueueMessage) -> Result<()> {
        // ---
        let wrap = |e: QueueError| match e {
            err @ QueueError::PublishFailed { .. } => err,
            other => QueueError::publish_failed(queue.as_str(), other.to_string()),
        };

        let channel = self.channel().await.map_err(wrap)?;
        self.ensure_declared(&channel, queue).await.map_err(wrap)?;

        let outbound = OutboundMessage {
            message_id: Uuid::new_v4().to_string(),
            headers: message.attributes_or_empty(),
            body: Bytes::from(message.body),
        };
        let message_id = outbound.message_id.clone();

        channel.publish(queue, outbound).await.map_err(wrap)?;

        log_debug!("[{}] published {message_id} to {queue}", self.provider_id);
        Ok(())
    }

    async fn subscribe(&self, queue: &QueueName, handler: HandlerPtr) -> Result<()> {
        // ---
        let wrap = |e: QueueError| match e {
            err @ QueueError::SubscribeFailed { .. } => err,
            other => QueueError::subscribe_failed(queue.as_str(), other.to_string()),
        };

        let (channel, epoch) = self.session().await.map_err(wrap)?;
        self.ensure_declared(&channel, queue).await.map_err(wrap)?;

        let mut consumers = self.consumers.lock().await;

        // Replace, never stack. A tag on a lost channel is already gone.
        if let Some(old) = consumers.remove(queue) {
            if old.channel.is_open() {
                if let Err(e) = old.channel.cancel(&old.tag).await {
                    log_warn!(
                        "[{}] cancel of replaced consumer {} on {queue} failed: {e}",
                        self.provider_id,
                        old.tag
                    );
                }
            }
        }

        let tag = channel
            .consume(queue, self.callback(queue, Arc::clone(&handler)))
            .await
            .map_err(wrap)?;

        log_info!("[{}] consuming {queue} as {tag}", self.provider_id);
        consumers.insert(
            queue.clone(),
            Consumer {
                tag,
                handler,
                channel,
                epoch,
            },
        );
        Ok(())
    }

    async fn unsubscribe(&self, queue: &QueueName) -> Result<()> {
        // ---
        let Some(consumer) = self.consumers.lock().await.remove(queue) else {
            log_debug!("[{}] unsubscribe of {queue}: no consumer", self.provider_id);
            return Ok(());
        };

        if !consumer.channel.is_open() {
            log_info!("[{}] dropped consumer on {queue} from a lost channel", self.provider_id);
            return Ok(());
        }
        consumer.channel.cancel(&consumer.tag).await?;

        log_info!("[{}] cancelled consumer {} on {queue}", self.provider_id, consumer.tag);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.closed.store(true, Ordering::SeqCst);

        let previous = std::mem::replace(
            &mut *lock_ignore_poison(&self.state),
            ConnectionState::Disconnected,
        );

        let channel = match previous {
            ConnectionState::Connected(channel, _) => Some(channel),
            ConnectionState::Connecting(pending) => pending.await.ok(),
            ConnectionState::Disconnected => None,
        };

        let consumers: Vec<(QueueName, Consumer)> = self.consumers.lock().await.drain().collect();

        for (queue, consumer) in consumers {
            if !consumer.channel.is_open() {
                continue;
            }
            if let Err(e) = consumer.channel.cancel(&consumer.tag).await {
                log_warn!(
                    "[{}] cancel of {} on {queue} during teardown failed: {e}",
                    self.provider_id,
                    consumer.tag
                );
            }
        }

        let Some(channel) = channel else {
            log_info!("[{}] closed (was not connected)", self.provider_id);
            return Ok(());
        };

        if let Err(e) = channel.close_channel().await {
            log_warn!("[{}] channel close failed: {e}", self.provider_id);
        }

        if let Err(e) = channel.close_connection().await {
            log_warn!("[{}] connection close failed: {e}", self.provider_id);
        }

        log_info!("[{}] event-driven provider closed", self.provider_id);
        Ok(())
    }
}
