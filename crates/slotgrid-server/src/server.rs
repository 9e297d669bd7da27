//! Axum server: WebSocket sessions plus a small read-only HTTP API.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::protocol::SnapshotMessage;
use crate::session;

type AppState = Arc<Coordinator>;

/// Coordination server.
pub struct SlotServer {
    coordinator: Arc<Coordinator>,
}

impl SlotServer {
    /// Create a server with an all-FREE grid sized by `config`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        Ok(Self::from_coordinator(Arc::new(Coordinator::new(config)?)))
    }

    pub fn from_coordinator(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Build the router for the server.
    pub fn router(&self) -> Router {
        Router::new()
            // WebSocket sessions; plain clients dial the bare address
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health))
            .route("/api/v1/snapshot", get(snapshot_handler))
            .route("/api/v1/status", get(status_handler))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.coordinator.clone())
    }

    /// Listen on the configured address until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.coordinator.config().addr).await?;
        self.serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Ctrl-C received");
        })
        .await
    }

    /// Serve on `listener` until `signal` resolves, then stop every session.
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let config = self.coordinator.config();
        info!(
            "WebSocket server is running on ws://{} ({}x{} slots)",
            addr, config.rows, config.cols
        );

        let coordinator = self.coordinator();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                signal.await;
                coordinator.shutdown();
            })
            .await?;

        info!("Server stopped");
        Ok(())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (writer, reader) = socket.split();
        let summary = session::run(state, reader, writer).await;
        debug!("Session finished: {:?}", summary);
    })
}

async fn health() -> &'static str {
    "OK"
}

async fn snapshot_handler(State(state): State<AppState>) -> Json<SnapshotMessage> {
    Json(SnapshotMessage::from(&state.snapshot()))
}

/// Server status response.
#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    slots: usize,
    claimed: usize,
    observers: usize,
    version: u64,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.snapshot();
    Json(StatusResponse {
        status: if state.is_shutting_down() {
            "shutting_down"
        } else {
            "ok"
        },
        slots: snapshot.len(),
        claimed: snapshot.claimed_count(),
        observers: state.observers().len(),
        version: snapshot.version(),
    })
}
