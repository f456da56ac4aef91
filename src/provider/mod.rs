//! Provider adapter implementations.
//!
//! This module provides the concrete implementations behind the
//! `QueueProvider` facade, grouped by delivery model:
//!
//! - [`polling`]: bounded-wait receive loops with visibility-timeout redelivery
//! - [`event_driven`]: broker push with explicit ack/nack
//!
//! Network-backed providers are hidden behind feature flags and exposed only
//! through constructor functions. When a feature is disabled its constructor
//! still exists and returns an error, so dispatch code needs no `cfg`.

pub mod event_driven;
pub mod memory;
pub mod polling;

pub use memory::{
    //
    create_memory_polling_provider,
    create_memory_polling_provider_with_service,
    create_memory_provider,
    create_memory_provider_with_broker,
};

#[cfg(feature = "provider_lapin")]
pub use event_driven::lapin::create_lapin_provider;

#[cfg(not(feature = "provider_lapin"))]
pub async fn create_lapin_provider(
    _config: &crate::ProviderConfig,
) -> crate::Result<crate::ProviderPtr> {
    Err(crate::QueueError::Transport(
        "provider_lapin feature is not enabled".into(),
    ))
}

#[cfg(feature = "provider_sqs")]
pub use polling::sqs::create_sqs_provider;

#[cfg(not(feature = "provider_sqs"))]
pub async fn create_sqs_provider(
    _config: &crate::ProviderConfig,
) -> crate::Result<crate::ProviderPtr> {
    Err(crate::QueueError::Transport(
        "provider_sqs feature is not enabled".into(),
    ))
}
