//! Axum WebSocket upgrade handlers.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;

use super::connection::run_connection;
use crate::app_state::AppState;
use crate::domain::TelescopeId;

/// `GET /ws`: Upgrade to a WebSocket that addresses telescopes per message.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let manager = Arc::clone(&state.ws_manager);
    ws.on_upgrade(move |socket| run_connection(socket, manager, None))
}

/// `GET /ws/{telescope_id}`: Upgrade to a WebSocket whose messages default
/// to `telescope_id`. Peer gateways connect here.
pub async fn ws_telescope_handler(
    ws: WebSocketUpgrade,
    Path(telescope_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let manager = Arc::clone(&state.ws_manager);
    let telescope_id = TelescopeId::new(telescope_id);
    ws.on_upgrade(move |socket| run_connection(socket, manager, Some(telescope_id)))
}
