// tests/common/mod.rs

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use mom_pubsub::{
    // ---
    ConnectionId,
    ConnectionSink,
    HandlerOutcome,
    HandlerPtr,
    MessageHandler,
    ProviderPtr,
    QueueError,
    QueueMessage,
    QueueName,
    QueueProvider,
    Result,
};

/// Wraps a provider and counts facade calls per queue.
pub struct CountingProvider {
    inner: ProviderPtr,
    publishes: Mutex<HashMap<String, usize>>,
    subscribes: Mutex<HashMap<String, usize>>,
    unsubscribes: Mutex<HashMap<String, usize>>,
    fail_subscribe: AtomicBool,
    held: Mutex<Option<(String, Arc<Notify>)>>,
    parked: AtomicUsize,
}

impl CountingProvider {
    pub fn new(inner: ProviderPtr) -> Arc<Self> {
        Arc::new(Self {
            inner,
            publishes: Mutex::new(HashMap::new()),
            subscribes: Mutex::new(HashMap::new()),
            unsubscribes: Mutex::new(HashMap::new()),
            fail_subscribe: AtomicBool::new(false),
            held: Mutex::new(None),
            parked: AtomicUsize::new(0),
        })
    }

    /// Make subscribes to `queue` wait until the returned gate is notified.
    pub fn hold_subscribe(&self, queue: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.held.lock().unwrap() = Some((queue.to_string(), Arc::clone(&gate)));
        gate
    }

    /// Subscribes currently waiting on a held gate.
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn publishes(&self, queue: &str) -> usize {
        self.publishes.lock().unwrap().get(queue).copied().unwrap_or(0)
    }

    pub fn total_publishes(&self) -> usize {
        self.publishes.lock().unwrap().values().sum()
    }

    pub fn subscribes(&self, queue: &str) -> usize {
        self.subscribes.lock().unwrap().get(queue).copied().unwrap_or(0)
    }

    pub fn unsubscribes(&self, queue: &str) -> usize {
        self.unsubscribes.lock().unwrap().get(queue).copied().unwrap_or(0)
    }
}

fn bump(map: &Mutex<HashMap<String, usize>>, queue: &QueueName) {
    *map.lock().unwrap().entry(queue.to_string()).or_default() += 1;
}

#[async_trait::async_trait]
impl QueueProvider for CountingProvider {
    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }

    async fn publish(&self, queue: &QueueName, message: QueueMessage) -> Result<()> {
        bump(&self.publishes, queue);
        self.inner.publish(queue, message).await
    }

    async fn subscribe(&self, queue: &QueueName, handler: HandlerPtr) -> Result<()> {
        bump(&self.subscribes, queue);

        let held = self.held.lock().unwrap().clone();
        if let Some((name, gate)) = held {
            if name == queue.as_str() {
                self.parked.fetch_add(1, Ordering::SeqCst);
                gate.notified().await;
                self.parked.fetch_sub(1, Ordering::SeqCst);
            }
        }

        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(QueueError::subscribe_failed(queue.as_str(), "injected failure"));
        }
        self.inner.subscribe(queue, handler).await
    }

    async fn unsubscribe(&self, queue: &QueueName) -> Result<()> {
        bump(&self.unsubscribes, queue);
        self.inner.unsubscribe(queue).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

/// Records every delivery; connections listed in `broken` fail.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(ConnectionId, String, QueueMessage)>>,
    broken: Mutex<Vec<ConnectionId>>,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn break_connection(&self, conn: &ConnectionId) {
        self.broken.lock().unwrap().push(conn.clone());
    }

    pub fn deliveries_to(&self, conn: &ConnectionId) -> Vec<QueueMessage> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| c == conn)
            .map(|(_, _, m)| m.clone())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ConnectionSink for RecordingSink {
    fn deliver(&self, conn: &ConnectionId, queue: &QueueName, message: &QueueMessage) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.broken.lock().unwrap().contains(conn) {
            return Err(QueueError::Transport(format!("{conn} is closed")));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((conn.clone(), queue.to_string(), message.clone()));
        Ok(())
    }
}

/// Handler that records messages and fails its first `fail_first` calls.
pub struct Recorder {
    seen: Mutex<Vec<QueueMessage>>,
    calls: AtomicUsize,
    fail_first: usize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Self::failing_first(0)
    }

    pub fn failing_first(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail_first,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<QueueMessage> {
        self.seen.lock().unwrap().clone()
    }

    pub fn as_handler(self: &Arc<Self>) -> HandlerPtr {
        self.clone()
    }
}

#[async_trait::async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, _queue: &QueueName, message: QueueMessage) -> HandlerOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(message);
        if call < self.fail_first {
            HandlerOutcome::Failure(format!("induced failure #{}", call + 1))
        } else {
            HandlerOutcome::Success
        }
    }
}

pub fn queue(name: &str) -> QueueName {
    QueueName::new(name).expect("valid queue name")
}

/// Poll `cond` every few milliseconds until it holds or `timeout_ms` passes.
pub async fn eventually(timeout_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
