//! Axum Handlers for the HTTP API
//!
//! `utoipa` doc comments on each handler feed the OpenAPI document.

use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Json},
};
use chrono::Utc;
use std::sync::Arc;

use crate::{
    models::{ErrorResponse, HealthResponse},
    state::AppState,
};

pub const SERVICE_NAME: &str = "sonic-bridge";

/// Report service health and the number of live calls.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        model: state.config.model_id.clone(),
        active_connections: state.registry.len().await,
        timestamp: Utc::now(),
    })
}

/// JSON 404 for unknown routes.
pub async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            message: format!("No route for {}", uri.path()),
        }),
    )
}
