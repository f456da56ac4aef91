// src/multiplexer/fanout.rs

use std::sync::Arc;

use super::SubscriptionRegistry;
use crate::{
    //
    log_debug,
    log_warn,
    HandlerOutcome,
    MessageHandler,
    QueueMessage,
    QueueName,
    SinkPtr,
};

/// The one handler registered with the provider for a queue.
///
/// Holds only the queue name plus injected references; recipients are looked
/// up in the registry on every delivery, never captured.
pub struct FanOutHandler {
    queue: QueueName,
    registry: Arc<SubscriptionRegistry>,
    sink: SinkPtr,
}

impl FanOutHandler {
    pub fn new(queue: QueueName, registry: Arc<SubscriptionRegistry>, sink: SinkPtr) -> Self {
        Self {
            queue,
            registry,
            sink,
        }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }
}

#[async_trait::async_trait]
impl MessageHandler for FanOutHandler {
    /// Deliver to every interested connection. A failed send affects only
    /// that recipient; the message counts as handled either way.
    async fn handle(&self, _queue: &QueueName, message: QueueMessage) -> HandlerOutcome {
        // ---
        let recipients = self.registry.interested_in(&self.queue);

        if recipients.is_empty() {
            log_debug!("fan-out on {}: no interested connections", self.queue);
        }

        for conn in &recipients {
            if let Err(e) = self.sink.deliver(conn, &self.queue, &message) {
                log_warn!("fan-out on {}: delivery to {conn} failed: {e}", self.queue);
            }
        }

        HandlerOutcome::Success
    }
}
