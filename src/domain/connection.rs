// src/domain/connection.rs

//! Connection identity and the outbound delivery seam.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::{QueueMessage, QueueName, Result};

/// Identifier of one live client connection.
///
/// Assigned by the transport layer at connect time and invalid after
/// disconnect. Opaque to the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the connection ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pushes inbound messages to individual client connections.
///
/// Implemented by the connection layer. A failure affects only the
/// addressed connection.
pub trait ConnectionSink: Send + Sync {
    fn deliver(&self, conn: &ConnectionId, queue: &QueueName, message: &QueueMessage) -> Result<()>;
}

/// Shared sink pointer.
pub type SinkPtr = Arc<dyn ConnectionSink>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_generate_unique() {
        // ---
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 36);
    }
}
