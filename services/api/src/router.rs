//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoint, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AgentSummary, BreakerResetResponse, BreakerStatus, ErrorResponse, HealthResponse,
        TokenResponse,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_breakers,
        handlers::reset_breaker,
        handlers::webrtc_session,
        handlers::ephemeral_token,
    ),
    components(
        schemas(HealthResponse, BreakerStatus, BreakerResetResponse, AgentSummary, TokenResponse, ErrorResponse)
    ),
    tags(
        (name = "Voice Bridge API", description = "Realtime voice sessions for configured agents")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/resilience/breakers", get(handlers::list_breakers))
        .route(
            "/api/v1/resilience/breakers/{name}/reset",
            post(handlers::reset_breaker),
        )
        .route(
            "/api/v1/realtime/session/{agent_id}",
            post(handlers::webrtc_session),
        )
        .route(
            "/api/v1/realtime/token/{agent_id}",
            get(handlers::ephemeral_token),
        )
        .route("/ws/realtime/{agent_id}", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
