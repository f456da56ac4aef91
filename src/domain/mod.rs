//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! queue backends, protocols, or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod connection;
mod provider;
mod queue;

pub use connection::{
    //
    ConnectionId,
    ConnectionSink,
    SinkPtr,
};

pub use provider::{
    //
    handler_fn,
    HandlerOutcome,
    HandlerPtr,
    MessageHandler,
    ProviderPtr,
    QueueProvider,
};

pub use queue::{
    //
    QueueMessage,
    QueueName,
};
