// src/domain/queue.rs

//! Queue-level value types.
//!
//! A [`QueueName`] is the sole correlation key between publishers,
//! subscribers and backend queues. A [`QueueMessage`] is the unit carried
//! between them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{QueueError, Result};

/// A validated queue name.
///
/// Opaque, case- and byte-sensitive, never normalized. Empty or
/// whitespace-only names are rejected at construction.
///
/// Queue names are immutable, cheap to clone, and safe to share across threads.
///
/// ```
/// # use mom_pubsub::QueueName;
/// let name = QueueName::new("orders").unwrap();
/// assert_eq!(name.as_str(), "orders");
/// assert!(QueueName::new("   ").is_err());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName(Arc<str>);

impl QueueName {
    /// Validate and wrap a queue name.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Validation`] when the name is empty or consists
    /// only of whitespace.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        // ---
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::invalid(
                "queueName must be a non-empty, non-whitespace string",
            ));
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for QueueName {
    type Error = QueueError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for QueueName {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl Serialize for QueueName {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for QueueName {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        QueueName::new(raw).map_err(serde::de::Error::custom)
    }
}

/// A message as seen by publishers and subscribers.
///
/// `id` is assigned by the backend once it accepts the message; a message
/// being published has none. `attributes` is a flat string map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub body: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
}

impl QueueMessage {
    /// New outbound message without attributes.
    pub fn new(body: impl Into<String>) -> Self {
        // ---
        Self {
            id: None,
            body: body.into(),
            attributes: None,
        }
    }

    /// Add one attribute, creating the map on first use.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        // ---
        self.attributes
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Stamp the backend-assigned identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attributes, or an empty map when none were supplied.
    pub fn attributes_or_empty(&self) -> HashMap<String, String> {
        self.attributes.clone().unwrap_or_default()
    }
}
