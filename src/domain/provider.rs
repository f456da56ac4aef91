// src/domain/provider.rs

//! Queue provider (facade) abstractions.
//!
//! This module defines the uniform contract the multiplexer depends on. It
//! intentionally avoids any reference to concrete queue services, brokers or
//! client libraries; concrete adapters live under `src/provider/`.
//!
//! Exactly one provider is bound at process start and shared behind a
//! [`ProviderPtr`].

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{QueueMessage, QueueName, Result};

/// Outcome of handing one inbound message to a [`MessageHandler`].
///
/// Adapters use it to decide between acknowledging (delete / ack) and
/// leaving the message for redelivery (leave unacked / nack with requeue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Message processed; the adapter acknowledges it.
    Success,

    /// Message not processed; the adapter lets the backend redeliver it.
    Failure(String),
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success)
    }
}

/// Receives inbound messages for one queue.
///
/// Invoked once per inbound message, asynchronously, with no ordering
/// relation to the `subscribe` call that registered it.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, queue: &QueueName, message: QueueMessage) -> HandlerOutcome;
}

/// Shared handler pointer.
pub type HandlerPtr = Arc<dyn MessageHandler>;

// Adapter turning an async closure into a MessageHandler
struct FnHandler<F, Fut>
where
    F: Fn(QueueName, QueueMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send,
{
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(QueueName, QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn handle(&self, queue: &QueueName, message: QueueMessage) -> HandlerOutcome {
        (self.func)(queue.clone(), message).await
    }
}

/// Wrap an async closure as a [`HandlerPtr`].
///
/// ```
/// # use mom_pubsub::{handler_fn, HandlerOutcome};
/// let handler = handler_fn(|queue, msg| async move {
///     println!("{queue}: {}", msg.body);
///     HandlerOutcome::Success
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(func: F) -> HandlerPtr
where
    F: Fn(QueueName, QueueMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    Arc::new(FnHandler {
        func,
        _phantom: PhantomData,
    })
}

/// Queue access facade.
///
/// Implementations must ensure that:
/// - `publish()` does not return success before the backend accepted the
///   message, creating the queue first if it is absent.
/// - `subscribe()` on a queue that already has an active subscription on
///   this instance replaces it; the old registration is retired before the
///   new one is installed.
/// - `unsubscribe()` is idempotent and stops future handler invocations for
///   the queue. Deliveries already handed to the handler are not retracted.
/// - `close()` tears down every subscription and backend resource; no
///   handler is invoked afterwards.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Treat the methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait QueueProvider: Send + Sync {
    // ---
    /// Short backend name for logging and health output.
    fn provider_name(&self) -> &'static str;

    /// Enqueue one message on the backend.
    async fn publish(&self, queue: &QueueName, message: QueueMessage) -> Result<()>;

    /// Start (or replace) the backend-level subscription for `queue`.
    async fn subscribe(&self, queue: &QueueName, handler: HandlerPtr) -> Result<()>;

    /// Tear down the backend-level subscription for `queue`, if any.
    async fn unsubscribe(&self, queue: &QueueName) -> Result<()>;

    /// Release every subscription and backend connection.
    async fn close(&self) -> Result<()>;
}

/// Shared provider pointer.
///
/// This is an `Arc<dyn QueueProvider>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same backend connection
pub type ProviderPtr = Arc<dyn QueueProvider>;
