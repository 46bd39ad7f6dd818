//! Runner side of the control protocol
//!
//! Serves the control socket plus health probes. Each connection must
//! authenticate with its first frame; after that every text frame is a
//! request answered in arrival order.

pub mod dispatch;
pub mod health;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::db::DbPool;
use crate::process::ProcessManager;
use crate::protocol::{AuthReply, CONTROL_SOCKET_PATH};
use crate::{Error, Result};

pub use dispatch::{ActionHandler, ActionTable, ControlService, HandlerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    AwaitingAuth,
    Authenticated,
}

/// Router serving the control socket at [`CONTROL_SOCKET_PATH`]
pub fn control_router(service: Arc<ControlService>) -> Router {
    Router::new()
        .route(CONTROL_SOCKET_PATH, get(ws_upgrade))
        .with_state(service)
}

async fn ws_upgrade(
    State(service): State<Arc<ControlService>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control_socket(socket, service))
}

async fn handle_control_socket(socket: WebSocket, service: Arc<ControlService>) {
    let (mut sender, mut receiver) = socket.split();
    let mut state = ConnectionState::AwaitingAuth;

    tracing::debug!("control connection opened, awaiting auth");

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "control socket read failed");
                break;
            }
        };

        match state {
            ConnectionState::AwaitingAuth => {
                if !service.authenticate(&text) {
                    tracing::warn!("panel authentication failed, closing");
                    if let Ok(json) = serde_json::to_string(&AuthReply::failed()) {
                        let _ = sender.send(Message::Text(json.into())).await;
                    }
                    break;
                }

                let Ok(json) = serde_json::to_string(&AuthReply::authenticated()) else {
                    break;
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
                state = ConnectionState::Authenticated;
                tracing::info!("panel authenticated");
            }
            ConnectionState::Authenticated => {
                let response = service.handle_text(&text).await;
                let json = match serde_json::to_string(&response) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(echo = %response.echo, error = %e, "failed to encode response");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    tracing::debug!(echo = %response.echo, "panel gone before response was sent");
                    break;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    tracing::info!(authenticated = state == ConnectionState::Authenticated, "control connection closed");
}

/// Runner HTTP server: control socket, `/health`, `/ready`
pub struct RunnerServer {
    service: Arc<ControlService>,
    db: DbPool,
    processes: ProcessManager,
}

impl RunnerServer {
    #[must_use]
    pub fn new(service: ControlService, db: DbPool, processes: ProcessManager) -> Self {
        Self {
            service: Arc::new(service),
            db,
            processes,
        }
    }

    /// Build the router with all routes
    pub fn router(&self) -> Router {
        control_router(Arc::clone(&self.service))
            .merge(health::router())
            .merge(health::ready_router(self.db.clone(), self.processes.clone()))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on an already-bound listener until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if the server fails while running
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local: Option<SocketAddr> = listener.local_addr().ok();
        tracing::info!(addr = ?local, path = CONTROL_SOCKET_PATH, "runner listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Transport(format!("runner server error: {e}")))?;

        tracing::info!("runner server stopped");
        Ok(())
    }
}
