// src/provider/memory/queue_service.rs

//! In-process polling queue service.
//!
//! Implements [`PollingBackend`] with SQS-like behavior: queues are
//! addressed by URL, receives wait a bounded time for messages, and a
//! received message stays invisible for the visibility timeout unless it is
//! deleted with the receipt handle of that receipt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    //
    log_debug,
    QueueError,
    QueueName,
    Result,
};

use crate::provider::polling::{
    //
    BackendAttribute,
    PollingBackend,
    ReceivedMessage,
};

/// Default visibility timeout, matching SQS.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

struct StoredMessage {
    message_id: String,
    body: String,
    attributes: HashMap<String, BackendAttribute>,
    invisible_until: Option<Instant>,
    receipt_handle: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

#[derive(Default)]
struct ServiceQueue {
    messages: Vec<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct ServiceState {
    urls: HashMap<QueueName, String>,
    queues: HashMap<String, ServiceQueue>,
}

enum Attempt {
    Received(Vec<ReceivedMessage>),
    Empty { next_visible: Option<Instant> },
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn no_such_queue(queue_url: &str) -> QueueError {
    QueueError::Transport(format!("memory queue service: no queue at {queue_url}"))
}

/// In-process SQS-like queue service.
pub struct MemoryQueueService {
    state: Mutex<ServiceState>,
    visibility_timeout: Duration,
    receive_calls: AtomicU64,
    deleted: AtomicU64,
}

impl Default for MemoryQueueService {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT)
    }
}

impl MemoryQueueService {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ServiceState::default()),
            visibility_timeout,
            receive_calls: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Messages stored in `queue`, visible or not.
    pub fn message_count(&self, queue: &QueueName) -> usize {
        self.with_queue(queue, |q, _| q.messages.len())
    }

    /// Messages currently hidden by an outstanding receipt.
    pub fn in_flight_count(&self, queue: &QueueName) -> usize {
        self.with_queue(queue, |q, now| {
            q.messages.iter().filter(|m| !m.is_visible(now)).count()
        })
    }

    /// Receive calls served since creation.
    pub fn receive_calls(&self) -> u64 {
        self.receive_calls.load(Ordering::Relaxed)
    }

    /// Messages deleted since creation.
    pub fn deleted_count(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    fn with_queue<T: Default>(&self, queue: &QueueName, f: impl FnOnce(&ServiceQueue, Instant) -> T) -> T {
        // ---
        let state = lock_ignore_poison(&self.state);
        state
            .urls
            .get(queue)
            .and_then(|url| state.queues.get(url))
            .map(|q| f(q, Instant::now()))
            .unwrap_or_default()
    }

    fn notifier(&self, queue_url: &str) -> Result<Arc<Notify>> {
        let state = lock_ignore_poison(&self.state);
        state
            .queues
            .get(queue_url)
            .map(|q| Arc::clone(&q.notify))
            .ok_or_else(|| no_such_queue(queue_url))
    }

    fn try_receive(&self, queue_url: &str, max_messages: usize) -> Result<Attempt> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| no_such_queue(queue_url))?;

        let now = Instant::now();
        let mut received = Vec::new();

        for message in queue.messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }
            if !message.is_visible(now) {
                continue;
            }

            let receipt = Uuid::new_v4().to_string();
            message.invisible_until = Some(now + self.visibility_timeout);
            message.receipt_handle = Some(receipt.clone());

            received.push(ReceivedMessage {
                message_id: Some(message.message_id.clone()),
                body: message.body.clone(),
                attributes: message.attributes.clone(),
                receipt_handle: receipt,
            });
        }

        if !received.is_empty() {
            return Ok(Attempt::Received(received));
        }

        let next_visible = queue.messages.iter().filter_map(|m| m.invisible_until).min();
        Ok(Attempt::Empty { next_visible })
    }
}

#[async_trait::async_trait]
impl PollingBackend for MemoryQueueService {
    // ---
    fn backend_name(&self) -> &'static str {
        "memory-polling"
    }

    async fn lookup_queue(&self, queue: &QueueName) -> Result<Option<String>> {
        Ok(lock_ignore_poison(&self.state).urls.get(queue).cloned())
    }

    async fn create_queue(&self, queue: &QueueName) -> Result<String> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        if let Some(url) = state.urls.get(queue) {
            return Ok(url.clone());
        }

        let url = format!("memory://queues/{queue}");
        state.urls.insert(queue.clone(), url.clone());
        state.queues.insert(url.clone(), ServiceQueue::default());

        log_debug!("memory queue service: created {url}");
        Ok(url)
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: HashMap<String, BackendAttribute>,
    ) -> Result<String> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| no_such_queue(queue_url))?;

        let message_id = Uuid::new_v4().to_string();
        queue.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: body.to_string(),
            attributes,
            invisible_until: None,
            receipt_handle: None,
        });
        queue.notify.notify_waiters();

        Ok(message_id)
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        // ---
        self.receive_calls.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + wait;
        let notify = self.notifier(queue_url)?;

        loop {
            // Register interest before looking, so a send in between is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = match self.try_receive(queue_url, max_messages)? {
                Attempt::Received(messages) => return Ok(messages),
                Attempt::Empty { next_visible } => next_visible,
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let queue = state
            .queues
            .get_mut(queue_url)
            .ok_or_else(|| no_such_queue(queue_url))?;

        let position = queue
            .messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                QueueError::Transport("memory queue service: receipt handle is invalid".into())
            })?;

        queue.messages.remove(position);
        self.deleted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
