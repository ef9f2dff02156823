//! Read-only HTTP API: health, telescope listings, federation health and
//! the OpenAPI document.
//!
//! Resource endpoints are mounted under `/api/v1`.

pub mod handlers;

use axum::Router;
use utoipa::OpenApi;

use crate::app_state::AppState;

/// OpenAPI document for the HTTP endpoints.
#[derive(Debug, OpenApi)]
#[openapi(
    info(title = "scope-gateway", description = "Telescope control gateway"),
    paths(
        handlers::system::health_handler,
        handlers::telescopes::list_telescopes_handler,
        handlers::telescopes::remote_links_handler,
    ),
    components(schemas(
        handlers::system::HealthResponse,
        handlers::telescopes::TelescopeEntry,
        crate::federation::LinkHealth,
        crate::federation::LinkState,
        crate::service::Route,
        crate::ws::SubscriptionTopic,
    )),
    tags(
        (name = "System", description = "Service health"),
        (name = "Telescopes", description = "Local and federated telescopes"),
        (name = "Federation", description = "Links to peer gateways"),
    )
)]
pub struct ApiDoc;

/// Builds the complete API router.
pub fn build_router() -> Router<AppState> {
    let router = Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::system::routes());
    with_docs(router)
}

#[cfg(feature = "swagger-ui")]
fn with_docs(router: Router<AppState>) -> Router<AppState> {
    router.merge(utoipa_swagger_ui::SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
}

#[cfg(not(feature = "swagger-ui"))]
fn with_docs(router: Router<AppState>) -> Router<AppState> {
    router
}
