//! AMQP 0-9-1 broker binding using `lapin`.
//!
//! One [`LapinConnector::connect`] call opens a connection and a single
//! channel with publisher confirms enabled. Everything else in the
//! event-driven adapter runs on that channel.
//!
//! ## Queue semantics
//!
//! Queues are declared durable, non-exclusive, not auto-deleted, so they
//! outlive both consumers and the gateway process. Messages are published
//! persistent (`delivery_mode = 2`) to the default exchange with the queue
//! name as routing key.
//!
//! ## Consumers
//!
//! Each `consume` call starts a manual-ack consumer and spawns a task that
//! drains its delivery stream into the registered callback, one delivery at
//! a time. When the stream ends (cancel, channel loss) the callback receives
//! the `None` sentinel.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use lapin::{
    //
    acker::Acker,
    message::Delivery,
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        ConfirmSelectOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
};

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    ProviderConfig,
    ProviderPtr,
    QueueError,
    QueueName,
    Result,
};

use super::{
    //
    BrokerChannel,
    BrokerConnector,
    CallbackPtr,
    ChannelPtr,
    DeliveryAcker,
    EventDrivenProvider,
    InboundDelivery,
    OutboundMessage,
};

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

/// Opens lapin connections to one broker URL.
pub struct LapinConnector {
    provider_id: String,
    url: String,
}

impl LapinConnector {
    pub fn new(provider_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl BrokerConnector for LapinConnector {
    // ---
    fn broker_name(&self) -> &'static str {
        "amqp"
    }

    async fn connect(&self) -> Result<ChannelPtr> {
        // ---
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                let msg = format!("amqp: connection failed: {e}");
                log_error!("[{}] {msg}", self.provider_id);
                QueueError::Transport(msg)
            })?;

        let provider_id = self.provider_id.clone();
        connection.on_error(move |e| {
            log_error!("[{provider_id}] amqp connection error: {e}");
        });

        let channel = connection.create_channel().await.map_err(|e| {
            let msg = format!("amqp: channel creation failed: {e}");
            log_error!("[{}] {msg}", self.provider_id);
            QueueError::Transport(msg)
        })?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Transport(format!("amqp: confirm select failed: {e}")))?;

        log_info!("[{}] connected to AMQP broker", self.provider_id);

        Ok(Arc::new(LapinChannel {
            provider_id: self.provider_id.clone(),
            connection,
            channel,
        }))
    }
}

struct LapinChannel {
    provider_id: String,
    connection: Connection,
    channel: Channel,
}

struct LapinAcker(Acker);

#[async_trait::async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Transport(format!("amqp: ack failed: {e}")))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| QueueError::Transport(format!("amqp: nack failed: {e}")))
    }
}

fn encode_headers(headers: HashMap<String, String>) -> FieldTable {
    // ---
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.into(), AMQPValue::LongString(value.into()));
    }
    table
}

/// String-valued headers only; other AMQP value types are skipped.
fn decode_headers(table: Option<&FieldTable>) -> HashMap<String, String> {
    // ---
    let Some(table) = table else {
        return HashMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn into_inbound(delivery: Delivery) -> InboundDelivery {
    // ---
    InboundDelivery {
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        headers: decode_headers(delivery.properties.headers().as_ref()),
        body: delivery.data.into(),
        redelivered: delivery.redelivered,
        acker: Box::new(LapinAcker(delivery.acker)),
    }
}

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    // ---
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_queue(&self, queue: &QueueName) -> Result<()> {
        // ---
        let options = QueueDeclareOptions {
            passive: false,
            durable: true,
            exclusive: false,
            auto_delete: false,
            nowait: false,
        };

        self.channel
            .queue_declare(queue.as_str(), options, FieldTable::default())
            .await
            .map_err(|e| QueueError::creation_failed(queue.as_str(), e.to_string()))?;

        Ok(())
    }

    async fn publish(&self, queue: &QueueName, message: OutboundMessage) -> Result<()> {
        // ---
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_message_id(message.message_id.into())
            .with_headers(encode_headers(message.headers));

        let confirmation = self
            .channel
            .basic_publish(
                "", // default exchange
                queue.as_str(),
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| QueueError::publish_failed(queue.as_str(), e.to_string()))?
            .await
            .map_err(|e| QueueError::publish_failed(queue.as_str(), e.to_string()))?;

        if confirmation.is_nack() {
            return Err(QueueError::publish_failed(
                queue.as_str(),
                "broker rejected the message",
            ));
        }

        Ok(())
    }

    async fn consume(&self, queue: &QueueName, callback: CallbackPtr) -> Result<String> {
        // ---
        let mut consumer = self
            .channel
            .basic_consume(
                queue.as_str(),
                "", // broker-assigned tag
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::subscribe_failed(queue.as_str(), e.to_string()))?;

        let tag = consumer.tag().as_str().to_string();
        let provider_id = self.provider_id.clone();
        let queue = queue.clone();

        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => callback.on_delivery(Some(into_inbound(delivery))).await,
                    Err(e) => {
                        log_error!("[{provider_id}] consumer error on {queue}: {e}");
                        break;
                    }
                }
            }

            log_debug!("[{provider_id}] consumer stream ended for {queue}");
            callback.on_delivery(None).await;
        });

        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| QueueError::Transport(format!("amqp: cancel failed: {e}")))
    }

    async fn close_channel(&self) -> Result<()> {
        self.channel
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| QueueError::Transport(format!("amqp: channel close failed: {e}")))
    }

    async fn close_connection(&self) -> Result<()> {
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| QueueError::Transport(format!("amqp: connection close failed: {e}")))
    }
}

/// Creates a lapin-backed event-driven provider from the given configuration.
///
/// # Errors
///
/// Returns an error if:
/// - `amqp_url` is missing
/// - The initial connection to the broker fails
///
/// # Connection Behavior
///
/// The connection is opened immediately. Later losses are repaired lazily by
/// the next operation that needs the channel.
pub async fn create_lapin_provider(config: &ProviderConfig) -> Result<ProviderPtr> {
    // ---
    let url = config
        .amqp_url
        .as_deref()
        .ok_or_else(|| QueueError::MissingConfig("amqp provider requires amqp_url".into()))?;

    let connector = Arc::new(LapinConnector::new(config.provider_id.clone(), url));
    let provider = EventDrivenProvider::new(config.provider_id.clone(), connector);
    provider.connect().await?;

    Ok(Arc::new(provider))
}
