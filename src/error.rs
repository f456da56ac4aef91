use thiserror::Error;

/// Errors surfaced by providers, the multiplexer and the gateway.
///
/// The four queue-scoped variants carry the queue name and, where the backend
/// reported one, the underlying cause.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Queue is absent and could not or should not be auto-created
    #[error("queue `{queue}` not found{}", cause_suffix(.cause))]
    NotFound { queue: String, cause: Option<String> },

    /// Queue creation on the backend failed
    #[error("failed to create queue `{queue}`{}", cause_suffix(.cause))]
    CreationFailed { queue: String, cause: Option<String> },

    /// The backend did not accept a published message
    #[error("failed to publish to queue `{queue}`{}", cause_suffix(.cause))]
    PublishFailed { queue: String, cause: Option<String> },

    /// A backend-level subscription could not be established
    #[error("failed to subscribe to queue `{queue}`{}", cause_suffix(.cause))]
    SubscribeFailed { queue: String, cause: Option<String> },

    /// Inbound request failed shape or constraint checks
    #[error("validation failed: {}", details.join("; "))]
    Validation { details: Vec<String> },

    /// Backend connection or channel failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Required configuration value not provided
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Configuration values contradict each other
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn cause_suffix(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(": {cause}"),
        None => String::new(),
    }
}

impl QueueError {
    // ---
    pub fn not_found(queue: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::NotFound {
            queue: queue.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn creation_failed(queue: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::CreationFailed {
            queue: queue.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn publish_failed(queue: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::PublishFailed {
            queue: queue.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn subscribe_failed(queue: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::SubscribeFailed {
            queue: queue.into(),
            cause: Some(cause.into()),
        }
    }

    /// Single-detail validation failure.
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::Validation {
            details: vec![detail.into()],
        }
    }

    /// Queue the error is scoped to, if any.
    pub fn queue_name(&self) -> Option<&str> {
        match self {
            Self::NotFound { queue, .. }
            | Self::CreationFailed { queue, .. }
            | Self::PublishFailed { queue, .. }
            | Self::SubscribeFailed { queue, .. } => Some(queue),
            _ => None,
        }
    }

    /// Flat list of constraint violations for validation failures.
    pub fn details(&self) -> Option<&[String]> {
        match self {
            Self::Validation { details } => Some(details),
            _ => None,
        }
    }
}

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_display_includes_cause() {
        // ---
        let err = QueueError::publish_failed("orders", "channel closed");
        assert_eq!(
            err.to_string(),
            "failed to publish to queue `orders`: channel closed"
        );

        let err = QueueError::NotFound {
            queue: "orders".into(),
            cause: None,
        };
        assert_eq!(err.to_string(), "queue `orders` not found");
    }

    #[test]
    fn test_queue_name_and_details() {
        // ---
        let err = QueueError::subscribe_failed("billing", "boom");
        assert_eq!(err.queue_name(), Some("billing"));
        assert!(err.details().is_none());

        let err = QueueError::invalid("queueName must not be empty");
        assert_eq!(err.queue_name(), None);
        assert_eq!(
            err.details(),
            Some(&["queueName must not be empty".to_string()][..])
        );
    }
}
