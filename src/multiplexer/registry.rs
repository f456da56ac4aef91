// src/multiplexer/registry.rs

//! Interest sets and handler registrations shared by the multiplexer and its
//! fan-out handlers.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::{
    //
    ConnectionId,
    HandlerPtr,
    QueueName,
};

#[derive(Default)]
struct RegistryState {
    interests: HashMap<ConnectionId, HashSet<QueueName>>,
    handlers: HashMap<QueueName, HandlerPtr>,
}

/// Which connection wants which queue, and which queues have a handler
/// registered with the provider.
///
/// Every method is one short critical section; nothing is held across an
/// `.await`. Fan-out reads the live sets through [`interested_in`](Self::interested_in)
/// at delivery time.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create an empty interest set. Returns false if one already exists.
    pub fn register_connection(&self, conn: &ConnectionId) -> bool {
        // ---
        let mut state = self.lock();
        if state.interests.contains_key(conn) {
            return false;
        }
        state.interests.insert(conn.clone(), HashSet::new());
        true
    }

    /// Remove a connection and hand back its whole interest set.
    pub fn remove_connection(&self, conn: &ConnectionId) -> Option<HashSet<QueueName>> {
        self.lock().interests.remove(conn)
    }

    pub fn is_interested(&self, conn: &ConnectionId, queue: &QueueName) -> bool {
        self.lock()
            .interests
            .get(conn)
            .is_some_and(|queues| queues.contains(queue))
    }

    /// Add `queue` to the connection's set, creating the set if needed.
    /// Returns false if it was already present.
    pub fn add_interest(&self, conn: &ConnectionId, queue: &QueueName) -> bool {
        self.lock()
            .interests
            .entry(conn.clone())
            .or_default()
            .insert(queue.clone())
    }

    /// Returns false if `queue` was not in the connection's set.
    pub fn remove_interest(&self, conn: &ConnectionId, queue: &QueueName) -> bool {
        self.lock()
            .interests
            .get_mut(conn)
            .is_some_and(|queues| queues.remove(queue))
    }

    /// Connections whose set currently contains `queue`.
    pub fn interested_in(&self, queue: &QueueName) -> Vec<ConnectionId> {
        // ---
        self.lock()
            .interests
            .iter()
            .filter(|(_, queues)| queues.contains(queue))
            .map(|(conn, _)| conn.clone())
            .collect()
    }

    /// True if any connection still wants `queue`.
    pub fn has_interest(&self, queue: &QueueName) -> bool {
        self.lock()
            .interests
            .values()
            .any(|queues| queues.contains(queue))
    }

    pub fn has_handler(&self, queue: &QueueName) -> bool {
        self.lock().handlers.contains_key(queue)
    }

    pub fn insert_handler(&self, queue: QueueName, handler: HandlerPtr) {
        self.lock().handlers.insert(queue, handler);
    }

    pub fn remove_handler(&self, queue: &QueueName) -> Option<HandlerPtr> {
        self.lock().handlers.remove(queue)
    }

    /// Queues of one connection, sorted.
    pub fn queues_of(&self, conn: &ConnectionId) -> Vec<QueueName> {
        // ---
        let mut queues: Vec<QueueName> = self
            .lock()
            .interests
            .get(conn)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        queues.sort();
        queues
    }

    /// Queues with a registered handler, sorted.
    pub fn registered_queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<QueueName> = self.lock().handlers.keys().cloned().collect();
        queues.sort();
        queues
    }

    pub fn connection_count(&self) -> usize {
        self.lock().interests.len()
    }

    /// Drop every handler registration, returning the affected queues.
    pub fn clear_handlers(&self) -> Vec<QueueName> {
        self.lock().handlers.drain().map(|(queue, _)| queue).collect()
    }
}
