//! Provider builder for creating the process-wide queue provider.
//!
//! Provides a fluent builder API over [`ProviderConfig`] with conflict
//! detection, plus [`create_provider`] which dispatches a finished config to
//! the matching provider factory.

use std::time::Duration;

use crate::{
    //
    log_info,
    PollingConfig,
    ProviderConfig,
    ProviderKind,
    ProviderPtr,
    QueueError,
    Result,
    SqsCredentials,
};

/// Builder for the queue provider bound at process start.
///
/// # Examples
///
/// ## Explicit provider type
/// ```no_run
/// use mom_pubsub::ProviderBuilder;
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let provider = ProviderBuilder::new()
///     .provider_type("amqp")
///     .amqp_url("amqp://localhost:5672/%2f")
///     .provider_id("gateway-1")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Inferred from connection settings
/// ```no_run
/// use mom_pubsub::ProviderBuilder;
/// use std::time::Duration;
///
/// # async fn example() -> mom_pubsub::Result<()> {
/// let provider = ProviderBuilder::new()
///     .sqs_region("eu-west-1")        // implies provider_type("sqs")
///     .poll_interval(Duration::from_secs(2))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ProviderBuilder {
    provider_type: Option<String>,
    provider_id: Option<String>,
    amqp_url: Option<String>,
    sqs_region: Option<String>,
    sqs_endpoint: Option<String>,
    sqs_credentials: Option<SqsCredentials>,
    poll_interval: Option<Duration>,
    wait_time: Option<Duration>,
    max_messages: Option<usize>,
}

impl ProviderBuilder {
    /// Create a new provider builder.
    pub fn new() -> Self {
        Self {
            provider_type: None,
            provider_id: None,
            amqp_url: None,
            sqs_region: None,
            sqs_endpoint: None,
            sqs_credentials: None,
            poll_interval: None,
            wait_time: None,
            max_messages: None,
        }
    }

    /// Set explicit provider type.
    ///
    /// Valid values: `"memory"`, `"memory-polling"`, `"sqs"`, `"amqp"` (alias `"rabbitmq"`)
    ///
    /// If not specified, the type is inferred from the connection settings.
    pub fn provider_type(mut self, kind: impl Into<String>) -> Self {
        self.provider_type = Some(kind.into());
        self
    }

    /// Set the provider ID used in logs. Defaults to `"mom-pubsub"`.
    pub fn provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_id = Some(id.into());
        self
    }

    /// Set the broker URL, e.g. `"amqp://localhost:5672/%2f"`.
    pub fn amqp_url(mut self, url: impl Into<String>) -> Self {
        self.amqp_url = Some(url.into());
        self
    }

    pub fn sqs_region(mut self, region: impl Into<String>) -> Self {
        self.sqs_region = Some(region.into());
        self
    }

    /// Point SQS at a compatible endpoint.
    pub fn sqs_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.sqs_endpoint = Some(endpoint.into());
        self
    }

    pub fn sqs_credentials(
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

    /// Delay between poll cycles (polling providers).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Bounded wait of one receive call (polling providers).
    pub fn wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = Some(wait);
        self
    }

    /// Batch cap of one receive call (polling providers).
    pub fn max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }

    /// Resolve the settings into a [`ProviderConfig`] without connecting.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `provider_type` is not recognized
    /// - Both AMQP and SQS settings are given
    /// - Settings of one backend are given for another backend's type
    /// - A setting the selected backend requires is missing
    pub fn build_config(self) -> Result<ProviderConfig> {
        // ---
        let has_amqp = self.amqp_url.is_some();
        let has_sqs = self.sqs_region.is_some()
            || self.sqs_endpoint.is_some()
            || self.sqs_credentials.is_some();

        if has_amqp && has_sqs {
            return Err(QueueError::ConfigConflict(
                "Cannot combine AMQP and SQS connection settings".into(),
            ));
        }

        let kind = match self.provider_type.as_deref() {
            Some(kind) => kind.parse::<ProviderKind>()?,
            None if has_amqp => ProviderKind::Amqp,
            None if has_sqs => ProviderKind::Sqs,
            None => ProviderKind::Memory,
        };

        match kind {
            ProviderKind::Amqp if has_sqs => {
                return Err(QueueError::ConfigConflict(
                    "SQS settings given for an amqp provider".into(),
                ));
            }
            ProviderKind::Sqs if has_amqp => {
                return Err(QueueError::ConfigConflict(
                    "amqp_url given for an sqs provider".into(),
                ));
            }
            ProviderKind::Amqp if !has_amqp => {
                return Err(QueueError::MissingConfig("amqp_url".into()));
            }
            ProviderKind::Sqs if self.sqs_region.is_none() => {
                return Err(QueueError::MissingConfig("sqs_region".into()));
            }
            _ => {}
        }

        let defaults = PollingConfig::default();
        let polling = PollingConfig {
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            wait_time: self.wait_time.unwrap_or(defaults.wait_time),
            max_messages: self.max_messages.unwrap_or(defaults.max_messages),
        };

        Ok(ProviderConfig {
            kind,
            provider_id: self.provider_id.unwrap_or_else(|| "mom-pubsub".into()),
            amqp_url: self.amqp_url,
            sqs_region: self.sqs_region,
            sqs_endpoint: self.sqs_endpoint,
            sqs_credentials: self.sqs_credentials,
            polling,
        })
    }

    /// Build and connect the provider (consumes self).
    ///
    /// # Errors
    ///
    /// Returns the [`build_config`](Self::build_config) errors, or the
    /// provider factory's error (disabled feature, connection failure).
    pub async fn build(self) -> Result<ProviderPtr> {
        let config = self.build_config()?;
        create_provider(&config).await
    }
}

impl Default for ProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch a config to the provider factory for its kind.
///
/// Disabled network providers return `Err` via their feature stubs.
pub async fn create_provider(config: &ProviderConfig) -> Result<ProviderPtr> {
    // ---
    log_info!("[{}] creating {} provider", config.provider_id, config.kind);

    match config.kind {
        ProviderKind::Memory => crate::create_memory_provider(config).await,
        ProviderKind::MemoryPolling => crate::create_memory_polling_provider(config).await,
        ProviderKind::Sqs => crate::create_sqs_provider(config).await,
        ProviderKind::Amqp => crate::create_lapin_provider(config).await,
    }
}
