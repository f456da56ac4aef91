//! Public, backend-agnostic provider configuration.
//!
//! Adapters interpret the relevant subset of [`ProviderConfig`] into concrete
//! connection settings. The whole struct is consumed once at process start.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::QueueError;

/// Upper bound a single receive call may return on SQS-like services.
pub const MAX_BATCH_SIZE: usize = 10;

/// Which backend a [`ProviderConfig`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// In-process push broker (event-driven adapter).
    Memory,
    /// In-process polling queue service (polling adapter).
    MemoryPolling,
    /// AWS SQS or a compatible endpoint (polling adapter).
    Sqs,
    /// AMQP 0-9-1 broker such as RabbitMQ (event-driven adapter).
    Amqp,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Memory => "memory",
            ProviderKind::MemoryPolling => "memory-polling",
            ProviderKind::Sqs => "sqs",
            ProviderKind::Amqp => "amqp",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(ProviderKind::Memory),
            "memory-polling" => Ok(ProviderKind::MemoryPolling),
            "sqs" => Ok(ProviderKind::Sqs),
            "amqp" | "rabbitmq" => Ok(ProviderKind::Amqp),
            other => Err(QueueError::ConfigConflict(format!(
                "unrecognized provider: {other}, valid values: memory, memory-polling, sqs, amqp"
            ))),
        }
    }
}

/// Poll loop tuning for the polling adapter.
///
/// # Example
///
/// ```
/// use mom_pubsub::PollingConfig;
/// use std::time::Duration;
///
/// let polling = PollingConfig::default()
///     .with_poll_interval(Duration::from_millis(500))
///     .with_wait_time(Duration::from_millis(200));
/// assert_eq!(polling.max_messages, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
    /// Delay between the start of consecutive poll cycles.
    ///
    /// Never shorter than `wait_time`, so cycles do not overlap meaningfully.
    pub poll_interval: Duration,

    /// Bounded wait of a single receive call.
    pub wait_time: Duration,

    /// Batch cap of a single receive call (1..=10).
    pub max_messages: usize,
}

impl Default for PollingConfig {
    /// - `poll_interval`: 1s
    /// - `wait_time`: 1s
    /// - `max_messages`: 10
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            wait_time: Duration::from_secs(1),
            max_messages: MAX_BATCH_SIZE,
        }
    }
}

impl PollingConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait;
        self
    }

    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = max;
        self
    }

    /// Copy with the invariants applied: batch clamped to 1..=10, interval
    /// raised to at least the wait time (and never zero).
    pub fn normalized(&self) -> Self {
        // ---
        Self {
            poll_interval: self
                .poll_interval
                .max(self.wait_time)
                .max(Duration::from_millis(1)),
            wait_time: self.wait_time,
            max_messages: self.max_messages.clamp(1, MAX_BATCH_SIZE),
        }
    }
}

/// Static credentials for SQS-compatible endpoints.
#[derive(Clone, PartialEq, Eq)]
pub struct SqsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for SqsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Provider selection and connection parameters.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    // ---
    /// Backend selected at process start.
    pub kind: ProviderKind,

    /// Identifier of this provider instance, used for logging.
    pub provider_id: String,

    /// Broker connection URL (AMQP only), e.g. `amqp://localhost:5672/%2f`.
    pub amqp_url: Option<String>,

    /// Region (SQS only).
    pub sqs_region: Option<String>,

    /// Endpoint override for SQS-compatible services (SQS only).
    pub sqs_endpoint: Option<String>,

    /// Static credentials (SQS only). Falls back to the default provider chain.
    pub sqs_credentials: Option<SqsCredentials>,

    /// Poll loop tuning (polling adapters only).
    pub polling: PollingConfig,
}

impl ProviderConfig {
    /// In-process push broker config (no external backend).
    pub fn memory(provider_id: impl Into<String>) -> Self {
        Self::base(ProviderKind::Memory, provider_id)
    }

    /// In-process polling queue service config (no external backend).
    pub fn memory_polling(provider_id: impl Into<String>) -> Self {
        Self::base(ProviderKind::MemoryPolling, provider_id)
    }

    /// AMQP broker config.
    pub fn amqp(url: impl Into<String>, provider_id: impl Into<String>) -> Self {
        // ---
        let mut config = Self::base(ProviderKind::Amqp, provider_id);
        config.amqp_url = Some(url.into());
        config
    }

    /// SQS config for the given region.
    pub fn sqs(region: impl Into<String>, provider_id: impl Into<String>) -> Self {
        // ---
        let mut config = Self::base(ProviderKind::Sqs, provider_id);
        config.sqs_region = Some(region.into());
        config
    }

    fn base(kind: ProviderKind, provider_id: impl Into<String>) -> Self {
        Self {
            kind,
            provider_id: provider_id.into(),
            amqp_url: None,
            sqs_region: None,
            sqs_endpoint: None,
            sqs_credentials: None,
            polling: PollingConfig::default(),
        }
    }

    /// Point SQS at a compatible endpoint (e.g. a local emulator).
    pub fn with_sqs_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.sqs_endpoint = Some(endpoint.into());
        self
    }

    /// Use static SQS credentials instead of the default provider chain.
    pub fn with_sqs_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.sqs_credentials = Some(SqsCredentials {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        });
        self
    }

    /// Override the poll loop tuning.
    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }
}
