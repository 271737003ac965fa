//! Main Entrypoint for the Voice Bridge API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Connecting to the agent database.
//! 3. Building the circuit breaker registry, the OpenAI connector and the session manager.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use voicebridge_api::{
    config::Config, db::Db, router::create_router, state::AppState, ws::OpenAiRealtime,
};
use voicebridge_core::{
    resilience::CircuitBreakerRegistry,
    session::{SessionManager, SessionSettings},
    tools::ToolCatalog,
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
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

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Db::new(pool);
    db.ping().await.context("Database is not reachable")?;
    info!("Database connection established.");

    // --- 4. Initialize Shared Services ---
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker_settings()));
    let connector = OpenAiRealtime::new(
        &config.openai_base_url,
        config.realtime_ws_url.clone(),
        config.retry_policy(),
    )
    .context("Failed to build the OpenAI HTTP client")?;
    if config.openai_api_key.is_none() {
        info!("No platform OpenAI key configured; workspaces must supply their own.");
    }

    let sessions = SessionManager::new(
        Arc::new(db),
        Arc::new(connector),
        breakers,
        // No named host tools: agents use call_control and integration ids.
        Arc::new(ToolCatalog::new()),
        SessionSettings {
            platform_credential: config.openai_api_key.clone(),
            realtime: config.realtime_settings(),
            retry: config.retry_policy(),
        },
    );
    let app_state = Arc::new(AppState::new(sessions, config.clone()));

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        model = %config.realtime_model,
        bind_address = %config.bind_address,
        failure_threshold = config.breaker_failure_threshold,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
