//! Gateway connection registry
//!
//! Assigns connection ids and owns each connection's outbound channel. The
//! socket task drains the receiving half; everything else sends through the
//! manager.

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::messages::ServerEvent;
use crate::{
    //
    log_debug,
    ConnectionId,
    ConnectionSink,
    QueueError,
    QueueMessage,
    QueueName,
    Result,
};

/// Live connections and their outbound channels.
#[derive(Default)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection with a fresh id.
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        // ---
        let conn = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections.insert(conn.clone(), tx);
        log_debug!("connection {conn} registered with gateway");
        (conn, rx)
    }

    pub fn unregister(&self, conn: &ConnectionId) {
        if self.connections.remove(conn).is_some() {
            log_debug!("connection {conn} unregistered from gateway");
        }
    }

    /// Queue an event for one connection.
    ///
    /// # Errors
    ///
    /// [`QueueError::Transport`] if the connection is unknown or its socket
    /// task has stopped reading.
    pub fn send(&self, conn: &ConnectionId, event: ServerEvent) -> Result<()> {
        // ---
        let Some(tx) = self.connections.get(conn) else {
            return Err(QueueError::Transport(format!("unknown connection {conn}")));
        };

        tx.send(event)
            .map_err(|_| QueueError::Transport(format!("connection {conn} is closed")))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl ConnectionSink for ConnectionManager {
    fn deliver(&self, conn: &ConnectionId, queue: &QueueName, message: &QueueMessage) -> Result<()> {
        self.send(conn, ServerEvent::message(queue.as_str(), message.clone()))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_deliver_to_registered_connection() {
        // ---
        let manager = ConnectionManager::new();
        let (conn, mut rx) = manager.register();
        let queue = QueueName::new("orders").unwrap();

        manager
            .deliver(&conn, &queue, &QueueMessage::new("hello").with_id("m-1"))
            .unwrap();

        match rx.try_recv().unwrap() {
            ServerEvent::Message(event) => {
                assert_eq!(event.queue_name, "orders");
                assert_eq!(event.message.id.as_deref(), Some("m-1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_send_to_closed_connection_fails() {
        // ---
        let manager = ConnectionManager::new();
        let (conn, rx) = manager.register();
        drop(rx);

        let result = manager.send(&conn, ServerEvent::unsubscribed("q", "bye"));
        assert!(matches!(result, Err(QueueError::Transport(_))));

        manager.unregister(&conn);
        assert_eq!(manager.connection_count(), 0);
        assert!(manager.send(&conn, ServerEvent::unsubscribed("q", "bye")).is_err());
    }
}
