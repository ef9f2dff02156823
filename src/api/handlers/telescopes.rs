//! Telescope and federation listings.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::domain::TelescopeSummary;
use crate::federation::LinkHealth;
use crate::service::Route;

/// One reachable telescope.
#[derive(Debug, Serialize, ToSchema)]
pub struct TelescopeEntry {
    /// Telescope identifier.
    pub telescope_id: String,
    /// Where commands for it are executed.
    pub route: Route,
    /// Device address or peer URL.
    pub address: String,
    /// Whether the device connection or federation link is up.
    pub online: bool,
    /// Latest local status; absent for remote telescopes.
    #[schema(value_type = Option<Object>)]
    pub status: Option<serde_json::Value>,
}

impl From<TelescopeSummary> for TelescopeEntry {
    fn from(summary: TelescopeSummary) -> Self {
        Self {
            telescope_id: summary.telescope_id.to_string(),
            route: Route::Local,
            address: summary.address,
            online: summary.online,
            status: serde_json::to_value(summary.status).ok(),
        }
    }
}

impl From<LinkHealth> for TelescopeEntry {
    fn from(link: LinkHealth) -> Self {
        Self {
            telescope_id: link.telescope_id.to_string(),
            route: Route::Remote,
            address: link.url,
            online: link.state.is_connected(),
            status: None,
        }
    }
}

/// `GET /api/v1/telescopes`: Every telescope this gateway can route to.
#[utoipa::path(
    get,
    path = "/api/v1/telescopes",
    tag = "Telescopes",
    summary = "List telescopes",
    description = "Local telescopes (sorted by id) followed by telescopes reachable over federation links.",
    responses(
        (status = 200, description = "Telescope list", body = Vec<TelescopeEntry>),
    )
)]
pub async fn list_telescopes_handler(State(state): State<AppState>) -> impl IntoResponse {
    let service = state.ws_manager.service();
    let mut entries: Vec<TelescopeEntry> = service
        .registry()
        .list()
        .await
        .into_iter()
        .map(TelescopeEntry::from)
        .collect();
    entries.extend(service.remote().health().await.into_iter().map(TelescopeEntry::from));
    (StatusCode::OK, Json(entries))
}

/// `GET /api/v1/remote-links`: Federation link health.
#[utoipa::path(
    get,
    path = "/api/v1/remote-links",
    tag = "Federation",
    summary = "List federation links",
    description = "Per-link state, reconnect attempts, heartbeat age and outstanding commands.",
    responses(
        (status = 200, description = "Link health", body = Vec<LinkHealth>),
    )
)]
pub async fn remote_links_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.ws_manager.service().remote().health().await;
    (StatusCode::OK, Json(health))
}

/// Telescope routes, nested under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/telescopes", get(list_telescopes_handler))
        .route("/remote-links", get(remote_links_handler))
}
