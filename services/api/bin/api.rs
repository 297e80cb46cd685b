//! Main Entrypoint for the Sonic Bridge API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the inference stream client and shared services.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and closing every live call on shutdown.

use anyhow::Context;
use sonic_bridge_api::{
    config::Config,
    prompt::BasePromptComposer,
    router::create_router,
    state::AppState,
    ws::{ConnectionRegistry, bridge::CloseReason},
};
use sonic_realtime::WebSocketInferenceClient;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Waits for `Ctrl+C`, then closes every live call before the server stops.
async fn shutdown_signal(registry: Arc<ConnectionRegistry>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
    registry.close_all(CloseReason::ServerShutdown).await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    let inference = Arc::new(WebSocketInferenceClient::new(
        config.inference_url.clone(),
        config.model_id.clone(),
    ));
    let composer = Arc::new(BasePromptComposer::new(config.default_system_prompt.clone()));
    let registry = Arc::new(ConnectionRegistry::new());

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        inference,
        composer,
        registry: registry.clone(),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        model = %config.model_id,
        inference_url = %config.inference_url,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(registry))
    .await?;

    info!("Server has shut down.");
    Ok(())
}
