//! Gateway wire protocol
//!
//! Every WebSocket text frame carries one JSON object of the form
//! `{"event": "<name>", "data": {...}}`. Field names inside `data` are
//! camelCase.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::validation::validate_queue_name;
use crate::{QueueError, QueueMessage};

/// Event sent from client to gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Subscribe(QueueRequest),
    Unsubscribe(QueueRequest),
    Publish(PublishRequest),
}

/// Subscribe / unsubscribe payload
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct QueueRequest {
    #[validate(custom(function = "validate_queue_name"))]
    pub queue_name: String,
}

/// Publish payload
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[validate(custom(function = "validate_queue_name"))]
    pub queue_name: String,

    #[validate(nested)]
    pub message: PublishPayload,
}

/// Message part of a publish request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PublishPayload {
    #[validate(length(min = 1, message = "message.body must be a non-empty string"))]
    pub body: String,

    #[serde(default)]
    pub attributes: Option<HashMap<String, String>>,
}

impl From<PublishPayload> for QueueMessage {
    fn from(payload: PublishPayload) -> Self {
        QueueMessage {
            id: None,
            body: payload.body,
            attributes: payload.attributes,
        }
    }
}

/// Event sent from gateway to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Subscribed(Confirmation),
    Unsubscribed(Confirmation),
    Published(Confirmation),
    /// Inbound delivery for a subscribed queue
    Message(MessageEvent),
    Error(ErrorEvent),
}

/// Confirmation of a client request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub queue_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub queue_name: String,
    pub message: QueueMessage,
}

/// Structured error event; one per rejected request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub error: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
}

impl ServerEvent {
    pub fn subscribed(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Subscribed(Confirmation {
            queue_name: queue_name.into(),
            message: message.into(),
        })
    }

    pub fn unsubscribed(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Unsubscribed(Confirmation {
            queue_name: queue_name.into(),
            message: message.into(),
        })
    }

    pub fn published(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Published(Confirmation {
            queue_name: queue_name.into(),
            message: message.into(),
        })
    }

    pub fn message(queue_name: impl Into<String>, message: QueueMessage) -> Self {
        ServerEvent::Message(MessageEvent {
            queue_name: queue_name.into(),
            message,
        })
    }

    /// Error event for `err`.
    ///
    /// `queue_name` is used when the error itself does not name a queue.
    pub fn from_error(err: &QueueError, queue_name: Option<&str>) -> Self {
        // ---
        let (error, details) = match err {
            QueueError::Validation { details } => {
                ("Validation failed".to_string(), Some(details.clone()))
            }
            other => (other.to_string(), None),
        };

        ServerEvent::Error(ErrorEvent {
            error,
            details,
            queue_name: err.queue_name().or(queue_name).map(str::to_string),
        })
    }

    /// Short event name, as on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Subscribed(_) => "subscribed",
            ServerEvent::Unsubscribed(_) => "unsubscribed",
            ServerEvent::Published(_) => "published",
            ServerEvent::Message(_) => "message",
            ServerEvent::Error(_) => "error",
        }
    }
}
