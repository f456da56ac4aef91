// src/provider/memory/mod.rs

//! In-process queue backends.
//!
//! Two backends, one per adapter family, so both delivery models can run
//! without external infrastructure:
//!
//! - [`MemoryBroker`] pushes deliveries with ack/nack, behind the
//!   event-driven adapter (`memory`).
//! - [`MemoryQueueService`] serves bounded-wait receives with a visibility
//!   timeout, behind the polling adapter (`memory-polling`).
//!
//! Providers created without an explicit backend share a process-global one,
//! matching the semantics of several gateways attached to the same broker.
//! Tests construct their own backend for isolation.

mod broker;
mod queue_service;

use std::sync::{Arc, OnceLock};

pub use broker::{BrokerStats, MemoryBroker};
pub use queue_service::{MemoryQueueService, DEFAULT_VISIBILITY_TIMEOUT};

use crate::{
    //
    log_debug,
    ProviderConfig,
    ProviderPtr,
    Result,
};

use super::event_driven::EventDrivenProvider;
use super::polling::PollingProvider;

static GLOBAL_BROKER: OnceLock<MemoryBroker> = OnceLock::new();
static GLOBAL_QUEUE_SERVICE: OnceLock<Arc<MemoryQueueService>> = OnceLock::new();

fn global_broker() -> MemoryBroker {
    GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
}

fn global_queue_service() -> Arc<MemoryQueueService> {
    GLOBAL_QUEUE_SERVICE
        .get_or_init(|| Arc::new(MemoryQueueService::default()))
        .clone()
}

/// Create an event-driven provider over the process-global [`MemoryBroker`].
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_provider(config: &ProviderConfig) -> Result<ProviderPtr> {
    create_memory_provider_with_broker(config, global_broker()).await
}

/// Create an event-driven provider over the given broker.
///
/// Keep a clone of `broker` to inspect counters or simulate connection loss.
pub async fn create_memory_provider_with_broker(
    config: &ProviderConfig,
    broker: MemoryBroker,
) -> Result<ProviderPtr> {
    // ---
    log_debug!("{}: create memory provider", config.provider_id);

    let provider = EventDrivenProvider::new(config.provider_id.clone(), Arc::new(broker));
    provider.connect().await?;

    Ok(Arc::new(provider))
}

/// Create a polling provider over the process-global [`MemoryQueueService`].
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_polling_provider(config: &ProviderConfig) -> Result<ProviderPtr> {
    create_memory_polling_provider_with_service(config, global_queue_service()).await
}

/// Create a polling provider over the given queue service.
pub async fn create_memory_polling_provider_with_service(
    config: &ProviderConfig,
    service: Arc<MemoryQueueService>,
) -> Result<ProviderPtr> {
    // ---
    log_debug!("{}: create memory polling provider", config.provider_id);

    Ok(Arc::new(PollingProvider::new(
        config.provider_id.clone(),
        service,
        config.polling.clone(),
    )))
}
