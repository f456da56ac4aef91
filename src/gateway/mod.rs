//! WebSocket connection gateway.
//!
//! Thin transport in front of the [`Multiplexer`]: it assigns connection
//! ids, validates client requests, turns results into reply events and
//! pushes fan-out deliveries to sockets.
//!
//! Routes:
//!
//! - `GET /ws`: WebSocket endpoint, JSON text frames `{"event", "data"}`
//! - `GET /health`: `{status, provider, connections}`

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod server;
pub mod validation;

use std::future::Future;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub use connection::ConnectionManager;
pub use handlers::{handle_client_event, handle_client_text};
pub use messages::{ClientEvent, Confirmation, ErrorEvent, MessageEvent, ServerEvent};

use crate::{
    //
    log_info,
    Multiplexer,
    ProviderPtr,
    QueueError,
    Result,
};

/// Shared state of one gateway instance.
pub struct GatewayState {
    pub multiplexer: Multiplexer,
    pub connections: Arc<ConnectionManager>,
    shutdown: watch::Sender<bool>,
}

impl GatewayState {
    /// Wire a connection manager and a multiplexer around `provider`.
    pub fn new(provider: ProviderPtr) -> Arc<Self> {
        // ---
        let connections = Arc::new(ConnectionManager::new());
        let multiplexer = Multiplexer::new(provider, connections.clone());
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            multiplexer,
            connections,
            shutdown,
        })
    }

    /// Ask every open socket task to finish.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(server::websocket_handler))
        .route("/health", get(server::health_handler))
        .with_state(state)
}

/// Serve until `signal` resolves, then close sockets and tear down the provider.
pub async fn serve<F>(listener: TcpListener, state: Arc<GatewayState>, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    // ---
    if let Ok(addr) = listener.local_addr() {
        log_info!("gateway listening on {addr}");
    }

    let shutdown_state = Arc::clone(&state);
    let shutdown = async move {
        signal.await;
        log_info!("shutdown requested");
        shutdown_state.begin_shutdown();
    };

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| QueueError::Transport(format!("gateway server failed: {e}")))?;

    state.multiplexer.shutdown().await
}
