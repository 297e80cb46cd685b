//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the health endpoint, the call WebSocket, and OpenAPI documentation.

use crate::{
    handlers,
    models::{ErrorResponse, HealthResponse},
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::health),
    components(schemas(HealthResponse, ErrorResponse)),
    tags(
        (name = "Sonic Bridge API", description = "Bridges phone and browser calls to a speech-to-speech model stream. Calls use the `/ws` WebSocket.")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
        .fallback(handlers::not_found)
}
