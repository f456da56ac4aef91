//! Fan-out subscription multiplexer.
//!
//! Maps many client connections, each with its own set of queue interests,
//! onto at most one provider-level subscription per queue, and fans each
//! inbound message out to every connection interested at delivery time.
//!
//! ## State
//!
//! - Per connection: an interest set (empty after `on_connect`, removed on
//!   `on_disconnect`).
//! - Per queue: *unregistered*, or *registered* with exactly one
//!   [`FanOutHandler`] while at least one connection is interested.
//!
//! ## Concurrency
//!
//! `subscribe`, `unsubscribe` and `on_disconnect` take a lock keyed by queue
//! name, so the "first interest registers, last interest unregisters"
//! transitions of one queue never interleave while other queues proceed.
//! `shutdown` excludes all of them. Fan-out takes no lock; it reads the
//! registry directly, so a delivery never waits on a provider call.

mod fanout;
mod registry;

pub use fanout::FanOutHandler;
pub use registry::SubscriptionRegistry;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::{
    //
    log_debug,
    log_info,
    log_warn,
    ConnectionId,
    HandlerPtr,
    ProviderPtr,
    QueueMessage,
    QueueName,
    Result,
    SinkPtr,
};

/// Result of a successful [`Multiplexer::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// The connection was already subscribed; nothing changed.
    AlreadySubscribed,
    Subscribed,
}

impl SubscribeOutcome {
    /// Confirmation text sent back to the client.
    pub fn describe(&self, queue: &QueueName) -> String {
        match self {
            SubscribeOutcome::AlreadySubscribed => format!("Already subscribed to {queue}"),
            SubscribeOutcome::Subscribed => format!("Subscribed to {queue}"),
        }
    }
}

struct Inner {
    provider: ProviderPtr,
    registry: Arc<SubscriptionRegistry>,
    sink: SinkPtr,

    /// Shared by per-queue operations, exclusive for shutdown.
    lifecycle: RwLock<()>,
    queue_locks: DashMap<QueueName, Arc<AsyncMutex<()>>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    /// Bind the process-wide provider and the outbound connection sink.
    pub fn new(provider: ProviderPtr, sink: SinkPtr) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                provider,
                registry: Arc::new(SubscriptionRegistry::new()),
                sink,
                lifecycle: RwLock::new(()),
                queue_locks: DashMap::new(),
            }),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.inner.provider.provider_name()
    }

    /// Read access for inspection (health, tests).
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn on_connect(&self, conn: &ConnectionId) {
        // ---
        if self.inner.registry.register_connection(conn) {
            log_debug!("connection {conn} registered");
        }
    }

    /// Tear down every interest of `conn`, then forget it.
    ///
    /// Each queue goes through the same release path as an explicit
    /// unsubscribe. Unknown connections are ignored.
    pub async fn on_disconnect(&self, conn: &ConnectionId) {
        // ---
        let _running = self.inner.lifecycle.read().await;

        let Some(queues) = self.inner.registry.remove_connection(conn) else {
            return;
        };

        log_debug!("connection {conn} gone, releasing {} queue(s)", queues.len());

        for queue in queues {
            let lock = self.queue_lock(&queue);
            {
                let _guard = lock.lock().await;
                self.release_queue(&queue).await;
            }
            drop(lock);
            self.forget_idle_lock(&queue);
        }
    }

    /// Add `queue` to the connection's interests, registering a provider
    /// subscription if this is the first interest in `queue`.
    ///
    /// # Errors
    ///
    /// Provider failures are returned unchanged; the interest set is then
    /// left as it was.
    pub async fn subscribe(&self, conn: &ConnectionId, queue: &QueueName) -> Result<SubscribeOutcome> {
        // ---
        let _running = self.inner.lifecycle.read().await;
        let lock = self.queue_lock(queue);

        let outcome = {
            let _guard = lock.lock().await;
            self.subscribe_locked(conn, queue).await
        };

        drop(lock);
        if outcome.is_err() {
            self.forget_idle_lock(queue);
        }
        outcome
    }

    /// Caller holds the lock of `queue`.
    async fn subscribe_locked(&self, conn: &ConnectionId, queue: &QueueName) -> Result<SubscribeOutcome> {
        // ---
        let registry = &self.inner.registry;

        if registry.is_interested(conn, queue) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        // Interest goes in first so the very first delivery has a recipient.
        registry.add_interest(conn, queue);

        if !registry.has_handler(queue) {
            let handler: HandlerPtr = Arc::new(FanOutHandler::new(
                queue.clone(),
                Arc::clone(registry),
                Arc::clone(&self.inner.sink),
            ));

            if let Err(e) = self.inner.provider.subscribe(queue, Arc::clone(&handler)).await {
                registry.remove_interest(conn, queue);
                return Err(e);
            }

            registry.insert_handler(queue.clone(), handler);
            log_info!("queue {queue} registered with {}", self.provider_name());
        }

        log_debug!("connection {conn} subscribed to {queue}");
        Ok(SubscribeOutcome::Subscribed)
    }

    /// Remove `queue` from the connection's interests. Always succeeds.
    ///
    /// When no connection is left for `queue`, the handler is dropped and the
    /// provider subscription torn down before this returns; a provider error
    /// is logged only.
    pub async fn unsubscribe(&self, conn: &ConnectionId, queue: &QueueName) {
        // ---
        let _running = self.inner.lifecycle.read().await;
        let lock = self.queue_lock(queue);
        {
            let _guard = lock.lock().await;

            if self.inner.registry.remove_interest(conn, queue) {
                log_debug!("connection {conn} unsubscribed from {queue}");
                self.release_queue(queue).await;
            } else {
                log_debug!("connection {conn} not subscribed to {queue}, nothing to do");
            }
        }
        drop(lock);
        self.forget_idle_lock(queue);
    }

    /// Pass straight through to the provider.
    pub async fn publish(&self, queue: &QueueName, message: QueueMessage) -> Result<()> {
        self.inner.provider.publish(queue, message).await
    }

    /// Drop all handler registrations and close the provider.
    pub async fn shutdown(&self) -> Result<()> {
        // ---
        let _exclusive = self.inner.lifecycle.write().await;

        let released = self.inner.registry.clear_handlers();
        log_info!(
            "multiplexer shutting down, {} queue registration(s) dropped",
            released.len()
        );

        self.inner.provider.close().await
    }

    fn queue_lock(&self, queue: &QueueName) -> Arc<AsyncMutex<()>> {
        self.inner
            .queue_locks
            .entry(queue.clone())
            .or_default()
            .value()
            .clone()
    }

    /// Drop the lock of `queue` once nobody holds or waits on it.
    fn forget_idle_lock(&self, queue: &QueueName) {
        self.inner
            .queue_locks
            .remove_if(queue, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Caller holds the lock of `queue`.
    async fn release_queue(&self, queue: &QueueName) {
        // ---
        let registry = &self.inner.registry;

        if registry.has_interest(queue) {
            return;
        }

        if registry.remove_handler(queue).is_none() {
            return;
        }

        match self.inner.provider.unsubscribe(queue).await {
            Ok(()) => log_info!("queue {queue} released"),
            Err(e) => log_warn!("provider unsubscribe of {queue} failed: {e}"),
        }
    }
}
