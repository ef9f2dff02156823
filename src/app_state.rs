//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::domain::EventBus;
use crate::ws::GatewayWsManager;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<GatewayConfig>,
    /// WebSocket session manager; also owns the routing service.
    pub ws_manager: Arc<GatewayWsManager>,
    /// Device event bus.
    pub event_bus: EventBus,
}
