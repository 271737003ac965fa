//! Axum Handlers for the REST API
//!
//! Health, circuit breaker inspection, the WebRTC SDP exchange and ephemeral
//! token minting. `utoipa` doc comments generate the OpenAPI document.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info, warn};
use voicebridge_core::{error::SessionError, session::PreparedSession};

use crate::{
    models::{
        AgentSummary, BreakerResetResponse, BreakerStatus, ErrorResponse, HealthResponse,
        TokenResponse,
    },
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    /// A session setup failure, reported with the status it maps to.
    Session(SessionError),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Session(err) => {
                let status = StatusCode::from_u16(err.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if status.is_server_error() {
                    error!(error = %err, status = status.as_u16(), "Session setup failed");
                } else {
                    warn!(error = %err, status = status.as_u16(), "Session setup rejected");
                }
                let message = err.to_string();
                (status, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

async fn prepare(state: &AppState, agent_id: &str) -> Result<PreparedSession, ApiError> {
    let agent = state
        .sessions
        .load_agent(agent_id)
        .await
        .map_err(ApiError::Session)?;
    state
        .sessions
        .prepare(agent)
        .await
        .map_err(ApiError::Session)
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        app: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List the circuit breakers and their current state.
#[utoipa::path(
    get,
    path = "/api/v1/resilience/breakers",
    responses(
        (status = 200, description = "Breaker states", body = [BreakerStatus])
    )
)]
pub async fn list_breakers(State(state): State<Arc<AppState>>) -> Json<Vec<BreakerStatus>> {
    let breakers = state
        .breakers
        .snapshot()
        .into_iter()
        .map(BreakerStatus::from)
        .collect();
    Json(breakers)
}

/// Force a circuit breaker back to closed.
#[utoipa::path(
    post,
    path = "/api/v1/resilience/breakers/{name}/reset",
    responses(
        (status = 200, description = "Breaker reset", body = BreakerResetResponse),
        (status = 404, description = "No breaker with that name", body = ErrorResponse)
    ),
    params(
        ("name" = String, Path, description = "Service name the breaker guards")
    )
)]
pub async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<BreakerResetResponse>, ApiError> {
    if !state.breakers.reset(&name) {
        return Err(ApiError::NotFound(format!(
            "Circuit breaker '{name}' not found"
        )));
    }
    info!(service = %name, "Circuit breaker reset via API");
    Ok(Json(BreakerResetResponse { name, reset: true }))
}

/// Exchange a WebRTC SDP offer for the upstream SDP answer.
#[utoipa::path(
    post,
    path = "/api/v1/realtime/session/{agent_id}",
    request_body(content = String, content_type = "application/sdp", description = "SDP offer"),
    responses(
        (status = 200, description = "SDP answer", body = String, content_type = "application/sdp"),
        (status = 400, description = "Missing offer or agent not eligible", body = ErrorResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse),
        (status = 502, description = "Upstream handshake failed", body = ErrorResponse),
        (status = 503, description = "Upstream circuit open", body = ErrorResponse)
    ),
    params(
        ("agent_id" = String, Path, description = "Agent ID")
    )
)]
pub async fn webrtc_session(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    offer: Bytes,
) -> Result<Response, ApiError> {
    if offer.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("SDP offer is required".to_string()));
    }
    let prepared = prepare(&state, &agent_id).await?;
    let answer = state
        .sessions
        .negotiate_sdp(&prepared, offer)
        .await
        .map_err(ApiError::Session)?;
    info!(agent_id = %agent_id, "WebRTC session negotiated");
    Ok(([(header::CONTENT_TYPE, "application/sdp")], answer).into_response())
}

/// Mint an ephemeral client secret for a browser-side realtime session.
#[utoipa::path(
    get,
    path = "/api/v1/realtime/token/{agent_id}",
    responses(
        (status = 200, description = "Ephemeral token and session configuration", body = TokenResponse),
        (status = 400, description = "Agent not eligible", body = ErrorResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse),
        (status = 502, description = "Upstream handshake failed", body = ErrorResponse),
        (status = 503, description = "Upstream circuit open", body = ErrorResponse)
    ),
    params(
        ("agent_id" = String, Path, description = "Agent ID")
    )
)]
pub async fn ephemeral_token(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<TokenResponse>, ApiError> {
    let prepared = prepare(&state, &agent_id).await?;
    let grant = state
        .sessions
        .mint_token(&prepared)
        .await
        .map_err(ApiError::Session)?;

    let tools = prepared.tools.all_tool_definitions();
    let response = TokenResponse {
        client_secret: grant.raw,
        agent: AgentSummary::from(prepared.agent.as_ref()),
        session_config: serde_json::to_value(&prepared.upstream_config)?,
        tools: serde_json::to_value(&*tools)?,
    };
    info!(agent_id = %agent_id, "Ephemeral token minted");
    Ok(Json(response))
}
