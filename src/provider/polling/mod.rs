//! Polling provider adapter (cloud-queue style).
//!
//! Models a backend with no push capability. Queues are resolved or created
//! explicitly, and messages are pulled with a bounded-wait receive call that
//! returns a capped batch.
//!
//! ## Poll loop model
//!
//! - `subscribe()` marks the queue *live* and spawns one task per queue that
//!   runs a poll cycle immediately and then on a fixed interval. Cycles of one
//!   queue run sequentially inside that task and never overlap.
//! - A cycle checks liveness before the receive, after it returns, and again
//!   before each message is handed to the handler.
//! - On [`HandlerOutcome::Success`] the message is deleted using its receipt
//!   handle. On failure it is left alone; the backend's visibility timeout
//!   makes it eligible for redelivery. The adapter never retries by itself.
//!
//! ## Liveness
//!
//! The live-set maps a queue name to the generation of its current poll loop.
//! Replacing a subscription bumps the generation, so a retired loop observes
//! that it is no longer live even though the name still is.
//! `unsubscribe()` removes the name first, then signals the loop to stop and
//! waits for it to finish. The stop signal only interrupts the loop while it
//! is parked on the interval or inside a receive; a handler call already in
//! progress runs to completion together with its delete. No handler call for
//! that queue starts after `unsubscribe()` returns.
//!
//! Concrete queue services plug in through [`PollingBackend`].

#[cfg(feature = "provider_sqs")]
pub(crate) mod sqs;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    HandlerOutcome,
    HandlerPtr,
    PollingConfig,
    QueueError,
    QueueMessage,
    QueueName,
    QueueProvider,
    Result,
};

/// Message attribute in the shape SQS-like services carry it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAttribute {
    /// Backend data type, e.g. `String`, `Number`, `Binary`.
    pub data_type: String,

    /// Present for string-typed (and number-typed) values.
    pub string_value: Option<String>,
}

impl BackendAttribute {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: "String".into(),
            string_value: Some(value.into()),
        }
    }
}

/// One message returned by a receive call.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: Option<String>,
    pub body: String,
    pub attributes: HashMap<String, BackendAttribute>,

    /// Token identifying this particular receipt; required to delete.
    pub receipt_handle: String,
}

/// Client primitives of a polling queue service.
///
/// Queue URLs are opaque handles returned by the service.
#[async_trait::async_trait]
pub trait PollingBackend: Send + Sync {
    // ---
    fn backend_name(&self) -> &'static str;

    /// Resolve a queue handle. `Ok(None)` means the queue does not exist.
    async fn lookup_queue(&self, queue: &QueueName) -> Result<Option<String>>;

    /// Create a queue and return its handle.
    async fn create_queue(&self, queue: &QueueName) -> Result<String>;

    /// Enqueue a message and return the backend-assigned id.
    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: HashMap<String, BackendAttribute>,
    ) -> Result<String>;

    /// Receive up to `max_messages`, waiting at most `wait` for the first one.
    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Delete (acknowledge) one received message.
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;
}

/// Shared polling backend pointer.
pub type PollingBackendPtr = Arc<dyn PollingBackend>;

type LiveSet = Arc<Mutex<HashMap<QueueName, u64>>>;

/// How long a retiring loop may take to finish its in-flight handler call
/// before it is aborted.
const RETIRE_GRACE: Duration = Duration::from_secs(30);

/// A running poll loop and the signal that stops it.
struct PollLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Resolves once the loop has been told to stop (or its owner is gone).
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // ---
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Flatten backend attributes into the string map carried by [`QueueMessage`].
///
/// Attributes without a string value (binary attributes) are dropped.
pub fn flatten_attributes(
    attributes: &HashMap<String, BackendAttribute>,
) -> Option<HashMap<String, String>> {
    // ---
    let flat: HashMap<String, String> = attributes
        .iter()
        .filter_map(|(key, attr)| attr.string_value.clone().map(|v| (key.clone(), v)))
        .collect();

    if flat.is_empty() {
        None
    } else {
        Some(flat)
    }
}

/// Polling implementation of the `QueueProvider` facade.
pub struct PollingProvider {
    // ---
    provider_id: String,
    backend: PollingBackendPtr,
    config: PollingConfig,
    queue_urls: RwLock<HashMap<QueueName, String>>,
    live: LiveSet,
    loops: AsyncMutex<HashMap<QueueName, PollLoop>>,
    next_generation: AtomicU64,
}

impl PollingProvider {
    /// Create a polling provider over the given backend.
    ///
    /// `config` is normalized (batch cap, interval not shorter than the wait).
    pub fn new(provider_id: impl Into<String>, backend: PollingBackendPtr, config: PollingConfig) -> Self {
        // ---
        Self {
            provider_id: provider_id.into(),
            backend,
            config: config.normalized(),
            queue_urls: RwLock::new(HashMap::new()),
            live: Arc::new(Mutex::new(HashMap::new())),
            loops: AsyncMutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Effective (normalized) poll loop settings.
    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Number of queues with an active poll loop.
    pub async fn active_subscriptions(&self) -> usize {
        self.loops.lock().await.len()
    }

    /// Resolve the queue handle, creating the queue on a remote miss.
    async fn ensure_queue_exists(&self, queue: &QueueName) -> Result<String> {
        // ---
        if let Some(url) = self.queue_urls.read().await.get(queue) {
            return Ok(url.clone());
        }

        let url = match self.backend.lookup_queue(queue).await? {
            Some(url) => url,
            None => {
                let url = self.backend.create_queue(queue).await.map_err(|e| match e {
                    err @ QueueError::CreationFailed { .. } => err,
                    other => QueueError::creation_failed(queue.as_str(), other.to_string()),
                })?;
                log_info!("[{}] created queue {queue} at {url}", self.provider_id);
                url
            }
        };

        self.queue_urls
            .write()
            .await
            .insert(queue.clone(), url.clone());

        Ok(url)
    }

    /// Stop a poll loop and wait until it is gone.
    ///
    /// The in-flight handler call, if any, finishes first. The task is only
    /// aborted when it overruns [`RETIRE_GRACE`].
    async fn retire(&self, queue: &QueueName, poll_loop: PollLoop) {
        // ---
        let PollLoop { stop, mut handle } = poll_loop;
        let _ = stop.send(true);

        let joined = match timeout(RETIRE_GRACE, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                log_warn!(
                    "[{}] poll loop for {queue} still busy after {RETIRE_GRACE:?}, aborting",
                    self.provider_id
                );
                handle.abort();
                handle.await
            }
        };

        match joined {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => log_error!("[{}] poll loop for {queue} panicked: {e}", self.provider_id),
        }
    }
}

/// State one poll loop needs, detached from the provider.
struct PollCycle {
    // ---
    provider_id: String,
    queue: QueueName,
    queue_url: String,
    generation: u64,
    backend: PollingBackendPtr,
    handler: HandlerPtr,
    live: LiveSet,
    config: PollingConfig,
    stop: watch::Receiver<bool>,
}

impl PollCycle {
    fn is_live(&self) -> bool {
        lock_ignore_poison(&self.live).get(&self.queue) == Some(&self.generation)
    }

    async fn run(mut self) {
        // ---
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log_debug!("[{}] poll loop started for {}", self.provider_id, self.queue);

        loop {
            // First tick completes immediately.
            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => break,
                _ = ticker.tick() => {}
            }

            if !self.is_live() {
                break;
            }
            self.poll_once().await;
        }

        log_debug!("[{}] poll loop stopped for {}", self.provider_id, self.queue);
    }

    async fn poll_once(&mut self) {
        // ---
        let received = tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop) => return,
            received = self.backend.receive_messages(
                &self.queue_url,
                self.config.max_messages,
                self.config.wait_time,
            ) => received,
        };

        let batch = match received {
            Ok(batch) => batch,
            Err(e) => {
                log_error!("[{}] receive on {} failed: {e}", self.provider_id, self.queue);
                return;
            }
        };

        // Unsubscribed while the receive was waiting.
        if !self.is_live() {
            log_debug!(
                "[{}] dropping batch of {} for {}: no longer live",
                self.provider_id,
                batch.len(),
                self.queue
            );
            return;
        }

        for received in batch {
            if !self.is_live() {
                break;
            }

            let receipt_handle = received.receipt_handle;
            let message = QueueMessage {
                id: received.message_id,
                body: received.body,
                attributes: flatten_attributes(&received.attributes),
            };
            let message_id = message.id.clone().unwrap_or_default();

            match self.handler.handle(&self.queue, message).await {
                HandlerOutcome::Success => {
                    if let Err(e) = self
                        .backend
                        .delete_message(&self.queue_url, &receipt_handle)
                        .await
                    {
                        log_error!(
                            "[{}] delete of {message_id} on {} failed: {e}",
                            self.provider_id,
                            self.queue
                        );
                    }
                }
                HandlerOutcome::Failure(reason) => {
                    log_warn!(
                        "[{}] handler failed for {message_id} on {}, left for redelivery: {reason}",
                        self.provider_id,
                        self.queue
                    );
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl QueueProvider for PollingProvider {
    // ---
    fn provider_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    async fn publish(&self, queue: &QueueName, message: QueueMessage) -> Result<()> {
        // ---
        let url = self.ensure_queue_exists(queue).await?;

        let attributes = message
            .attributes_or_empty()
            .into_iter()
            .map(|(k, v)| (k, BackendAttribute::string(v)))
            .collect();

        let message_id = self
            .backend
            .send_message(&url, &message.body, attributes)
            .await
            .map_err(|e| match e {
                err @ QueueError::PublishFailed { .. } => err,
                other => QueueError::publish_failed(queue.as_str(), other.to_string()),
            })?;

        log_debug!("[{}] published {message_id} to {queue}", self.provider_id);
        Ok(())
    }

    async fn subscribe(&self, queue: &QueueName, handler: HandlerPtr) -> Result<()> {
        // ---
        let queue_url = self.ensure_queue_exists(queue).await?;

        let mut loops = self.loops.lock().await;

        // Replace, never stack: the old loop is gone before the new one starts.
        if let Some(old) = loops.remove(queue) {
            lock_ignore_poison(&self.live).remove(queue);
            self.retire(queue, old).await;
            log_debug!("[{}] replaced poll loop for {queue}", self.provider_id);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock_ignore_poison(&self.live).insert(queue.clone(), generation);

        let (stop, stop_rx) = watch::channel(false);

        let cycle = PollCycle {
            provider_id: self.provider_id.clone(),
            queue: queue.clone(),
            queue_url,
            generation,
            backend: Arc::clone(&self.backend),
            handler,
            live: Arc::clone(&self.live),
            config: self.config.clone(),
            stop: stop_rx,
        };

        let handle = tokio::spawn(cycle.run());
        loops.insert(queue.clone(), PollLoop { stop, handle });

        log_info!("[{}] subscribed to {queue}", self.provider_id);
        Ok(())
    }

    async fn unsubscribe(&self, queue: &QueueName) -> Result<()> {
        // ---
        // Mark dead first so an in-flight cycle stops touching its batch.
        lock_ignore_poison(&self.live).remove(queue);

        let poll_loop = self.loops.lock().await.remove(queue);
        match poll_loop {
            Some(poll_loop) => {
                self.retire(queue, poll_loop).await;
                log_info!("[{}] unsubscribed from {queue}", self.provider_id);
            }
            None => {
                log_debug!("[{}] unsubscribe of {queue}: not subscribed", self.provider_id);
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        lock_ignore_poison(&self.live).clear();

        let drained: Vec<(QueueName, PollLoop)> = self.loops.lock().await.drain().collect();
        for (_, poll_loop) in &drained {
            let _ = poll_loop.stop.send(true);
        }
        for (queue, poll_loop) in drained {
            self.retire(&queue, poll_loop).await;
        }

        self.queue_urls.write().await.clear();

        log_info!("[{}] polling provider closed", self.provider_id);
        Ok(())
    }
}
