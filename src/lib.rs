//! Provider-agnostic publish/subscribe over message queues, with fan-out to
//! many client connections.
//!
//! Many connections each subscribe to any set of named queues; the
//! [`Multiplexer`] keeps exactly one provider-level subscription per queue
//! and fans every inbound message out to the connections interested in it
//! at delivery time.
//!
//! One [`QueueProvider`] is bound at process start. Two delivery models sit
//! behind it:
//!
//! - polling (SQS style): bounded-wait receives, delete on success,
//!   visibility-timeout redelivery on failure
//! - event-driven (AMQP style): broker push, ack on success, nack with
//!   requeue on failure
//!
//! ```no_run
//! use mom_pubsub::{ConnectionManager, Multiplexer, ProviderBuilder, QueueName, QueueMessage, ConnectionId};
//! use std::sync::Arc;
//!
//! # async fn example() -> mom_pubsub::Result<()> {
//! let provider = ProviderBuilder::new().provider_type("memory").build().await?;
//! let connections = Arc::new(ConnectionManager::new());
//! let mux = Multiplexer::new(provider, connections.clone());
//!
//! let (conn, _inbox) = connections.register();
//! let orders = QueueName::new("orders")?;
//! mux.subscribe(&conn, &orders).await?;
//! mux.publish(&orders, QueueMessage::new("hello")).await?;
//! # Ok(())
//! # }
//! ```

// Import all sub modules once...
mod config;
mod domain;
mod error;
mod macros;
mod multiplexer;
mod provider_builder;

pub mod gateway;
pub mod provider;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

pub use config::{
    //
    PollingConfig,
    ProviderConfig,
    ProviderKind,
    SqsCredentials,
    MAX_BATCH_SIZE,
};

pub use error::{QueueError, Result};

// --- public re-exports
pub use domain::{
    //
    handler_fn,
    ConnectionId,
    ConnectionSink,
    HandlerOutcome,
    HandlerPtr,
    MessageHandler,
    ProviderPtr,
    QueueMessage,
    QueueName,
    QueueProvider,
    SinkPtr,
};

pub use multiplexer::{
    //
    FanOutHandler,
    Multiplexer,
    SubscribeOutcome,
    SubscriptionRegistry,
};

pub use provider::{
    //
    create_lapin_provider,
    create_memory_polling_provider,
    create_memory_polling_provider_with_service,
    create_memory_provider,
    create_memory_provider_with_broker,
    create_sqs_provider,
};

pub use provider::event_driven::EventDrivenProvider;
pub use provider::memory::{BrokerStats, MemoryBroker, MemoryQueueService};
pub use provider::polling::PollingProvider;

pub use gateway::{ConnectionManager, GatewayState, ServerEvent};

pub use provider_builder::{create_provider, ProviderBuilder};
