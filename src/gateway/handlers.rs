//! Client request dispatch
//!
//! Maps each validated client event onto the multiplexer and produces the
//! single reply event for it. Socket handling lives in `server`.

use super::messages::{ClientEvent, ServerEvent};
use super::validation::parse_client_event;
use crate::{
    //
    log_debug,
    log_warn,
    ConnectionId,
    Multiplexer,
    QueueError,
    QueueName,
};

/// Handle one text frame from `conn` and return the reply.
///
/// Invalid frames never reach the multiplexer.
pub async fn handle_client_text(mux: &Multiplexer, conn: &ConnectionId, text: &str) -> ServerEvent {
    // ---
    match parse_client_event(text) {
        Ok(event) => handle_client_event(mux, conn, event).await,
        Err(e) => {
            log_debug!("connection {conn} sent an invalid request: {e}");
            ServerEvent::from_error(&e, None)
        }
    }
}

/// Dispatch an already validated event.
pub async fn handle_client_event(mux: &Multiplexer, conn: &ConnectionId, event: ClientEvent) -> ServerEvent {
    // ---
    match event {
        ClientEvent::Subscribe(req) => {
            let queue = match QueueName::new(req.queue_name.as_str()) {
                Ok(queue) => queue,
                Err(e) => return ServerEvent::from_error(&e, Some(&req.queue_name)),
            };

            match mux.subscribe(conn, &queue).await {
                Ok(outcome) => ServerEvent::subscribed(queue.as_str(), outcome.describe(&queue)),
                Err(e) => reject(conn, "subscribe", &queue, &e),
            }
        }

        ClientEvent::Unsubscribe(req) => {
            let queue = match QueueName::new(req.queue_name.as_str()) {
                Ok(queue) => queue,
                Err(e) => return ServerEvent::from_error(&e, Some(&req.queue_name)),
            };

            mux.unsubscribe(conn, &queue).await;
            ServerEvent::unsubscribed(queue.as_str(), format!("Unsubscribed from {queue}"))
        }

        ClientEvent::Publish(req) => {
            let queue = match QueueName::new(req.queue_name.as_str()) {
                Ok(queue) => queue,
                Err(e) => return ServerEvent::from_error(&e, Some(&req.queue_name)),
            };

            match mux.publish(&queue, req.message.into()).await {
                Ok(()) => ServerEvent::published(queue.as_str(), format!("Message published to {queue}")),
                Err(e) => reject(conn, "publish", &queue, &e),
            }
        }
    }
}

fn reject(conn: &ConnectionId, op: &str, queue: &QueueName, err: &QueueError) -> ServerEvent {
    log_warn!("{op} on {queue} for connection {conn} failed: {err}");
    ServerEvent::from_error(err, Some(queue.as_str()))
}
