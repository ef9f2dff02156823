//! scope-gateway server entry point.
//!
//! Connects configured devices and peer gateways, then serves the
//! WebSocket and HTTP endpoints until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use scope_gateway::api;
use scope_gateway::app_state::AppState;
use scope_gateway::config::{GatewayConfig, LogFormat};
use scope_gateway::device::DeviceClient;
use scope_gateway::domain::{EventBus, TelescopeRegistry};
use scope_gateway::federation::RemoteLinkManager;
use scope_gateway::service::TelescopeService;
use scope_gateway::ws::GatewayWsManager;
use scope_gateway::ws::handler::{ws_handler, ws_telescope_handler};

/// Buffer between federation links and the relay task.
const REMOTE_RELAY_BUFFER: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env().context("loading configuration")?;
    init_tracing(config.log_format);
    tracing::info!(addr = %config.listen_addr, "starting scope-gateway");

    // Domain + federation
    let event_bus = EventBus::new(config.event_bus_capacity);
    let registry = Arc::new(TelescopeRegistry::new());
    let (relay_tx, relay_rx) = mpsc::channel(REMOTE_RELAY_BUFFER);
    let remote = Arc::new(RemoteLinkManager::new(relay_tx));

    // Service + WebSocket manager
    let service = TelescopeService::new(Arc::clone(&registry), Arc::clone(&remote));
    let ws_manager = Arc::new(GatewayWsManager::new(service, config.ws_heartbeat_interval));

    tokio::spawn(Arc::clone(&ws_manager).run_event_forwarder(event_bus.subscribe()));
    tokio::spawn(Arc::clone(&ws_manager).run_remote_relay(relay_rx));
    tokio::spawn(Arc::clone(&ws_manager).run_heartbeat());

    for endpoint in &config.telescopes {
        let client = Arc::new(DeviceClient::new(
            endpoint.telescope_id.clone(),
            config.device_client_config(endpoint),
            event_bus.clone(),
        ));
        if let Err(err) = client.connect().await {
            tracing::warn!(telescope_id = %endpoint.telescope_id, error = %err, "device unavailable at startup, retrying in background");
            let retrying = Arc::clone(&client);
            tokio::spawn(async move {
                if retrying.connect_with_retry().await.is_ok() {
                    tracing::info!(telescope_id = %retrying.telescope_id(), "device came online");
                }
            });
        }
        if let Err(err) = ws_manager.register_telescope_client(client).await {
            tracing::error!(telescope_id = %endpoint.telescope_id, error = %err, "telescope not registered");
        }
    }

    for controller in config.remote_controllers.clone() {
        let controller_id = controller.controller_id();
        if let Err(err) = ws_manager.add_remote_controller(controller).await {
            tracing::warn!(%controller_id, error = %err, "remote controller not connected at startup");
        }
    }

    let app_state = AppState {
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        event_bus,
    };

    let app = Router::new()
        .merge(api::build_router())
        .route("/ws", get(ws_handler))
        .route("/ws/{telescope_id}", get(ws_telescope_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    remote.disconnect_all().await;
    for client in registry.clients().await {
        client.disconnect().await;
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
