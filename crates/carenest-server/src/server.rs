//! `CarenestServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use carenest_core::{FamilyId, UserId};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::collaborators::Collaborators;
use crate::config::ServerConfig;
use crate::health::{HealthResponse, StatsResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::manager::{ConnectRequest, SessionManager};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session manager owning every connection.
    pub manager: Arc<SessionManager>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// Query parameters of a connection request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Access token.
    pub token: Option<String>,
    /// Family context to join.
    pub family_id: Option<String>,
}

/// The carenest server.
pub struct CarenestServer {
    config: ServerConfig,
    manager: Arc<SessionManager>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl CarenestServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Self {
        let manager = Arc::new(SessionManager::new(config.clone(), collaborators));
        Self {
            config,
            manager,
            metrics: None,
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws/chat/{user_id}", get(ws_chat_handler))
            .route("/ws/health", get(health_handler))
            .route("/ws/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind, start the heartbeat monitor, and serve until shutdown.
    ///
    /// Returns the bound address and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;

        self.manager.start();
        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "server stopped with error");
            }
        });

        info!(%addr, "carenest server listening");
        Ok((addr, handle))
    }

    /// Get the session manager.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /ws/chat/{user_id}?token=..&family_id=..
async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    Path(user_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let request = ConnectRequest {
        user_id: UserId::from(user_id),
        token: params.token,
        family_id: params
            .family_id
            .filter(|f| !f.is_empty())
            .map(FamilyId::from),
    };
    let manager = state.manager;
    // Transport hard cap. Frames between the configured limit and this one
    // get an inline error instead of a dropped socket.
    let transport_limit = manager.config().max_message_size.saturating_mul(4);

    ws.max_message_size(transport_limit)
        .on_upgrade(move |socket| async move {
            let _ = manager.accept(socket, request).await;
        })
}

/// GET /ws/health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.manager.health())
}

/// GET /ws/stats
async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(state.manager.stats())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
