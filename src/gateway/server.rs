//! WebSocket server implementation
//!
//! One task per socket reads client frames and dispatches them; a second
//! task drains the connection's outbound channel into the socket, so fan-out
//! deliveries and request replies share one ordered writer.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Json,
};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use super::handlers::handle_client_text;
use super::messages::ServerEvent;
use super::GatewayState;
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    ConnectionId,
    QueueError,
};

/// How long a closing connection may take to flush replies still queued.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// WebSocket endpoint handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one client socket until it closes or the gateway shuts down.
async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    // ---
    let (sink, mut stream) = socket.split();
    let (conn, outbound) = state.connections.register();
    let mut shutdown = state.shutdown.subscribe();

    state.multiplexer.on_connect(&conn);
    log_info!("connection {conn} opened");

    let mut writer = tokio::spawn(write_events(conn.clone(), outbound, sink));

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = shutdown.changed() => {
                log_debug!("connection {conn}: gateway shutting down");
                break;
            }
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                log_warn!("connection {conn}: socket error: {e}");
                break;
            }
            None => break,
        };

        let reply = match frame {
            Message::Text(text) => handle_client_text(&state.multiplexer, &conn, &text).await,
            Message::Binary(_) => ServerEvent::from_error(
                &QueueError::invalid("binary frames are not supported; send JSON text"),
                None,
            ),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        if state.connections.send(&conn, reply).is_err() {
            break;
        }
    }

    // Stop fan-out to this connection before dropping its channel. The
    // writer then flushes what is queued and exits on its own.
    state.multiplexer.on_disconnect(&conn).await;
    state.connections.unregister(&conn);

    if timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        log_warn!("connection {conn}: outbound flush timed out, dropping the rest");
        writer.abort();
    }

    log_info!("connection {conn} closed");
}

/// Drain `outbound` into `sink` as JSON text frames, in order.
///
/// Returns once every sender is gone and the queue is empty, or on the first
/// failed write. The sink is closed either way.
pub(crate) async fn write_events<S>(conn: ConnectionId, mut outbound: UnboundedReceiver<ServerEvent>, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    // ---
    while let Some(event) = outbound.recv().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(e) => {
                log_error!("connection {conn}: failed to encode {} event: {e}", event.name());
                continue;
            }
        };

        if let Err(e) = sink.send(Message::Text(text)).await {
            log_debug!("connection {conn}: socket write failed: {e}");
            break;
        }
    }

    let _ = sink.close().await;
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub provider: &'static str,
    pub connections: usize,
}

/// Liveness plus a little context.
pub async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        provider: state.multiplexer.provider_name(),
        connections: state.connections.connection_count(),
    })
}
