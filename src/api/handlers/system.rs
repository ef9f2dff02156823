//! System endpoints: health check.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    /// Address the server is bound to.
    listen_addr: String,
    /// Open WebSocket sessions.
    ws_connections: usize,
    /// Telescopes with a local device client.
    local_telescopes: usize,
    /// Federation links.
    remote_links: usize,
    /// Live device event bus subscribers.
    event_subscribers: usize,
}

/// `GET /health`: Service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health, version, bind address, session and telescope counts and event bus subscribers.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let service = state.ws_manager.service();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            listen_addr: state.config.listen_addr.to_string(),
            ws_connections: state.ws_manager.connection_count().await,
            local_telescopes: service.registry().len().await,
            remote_links: service.remote().len().await,
            event_subscribers: state.event_bus.receiver_count(),
        }),
    )
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}
