//! Manages the client WebSocket lifecycle for a realtime voice session.

use super::{
    bridge::run_bridge,
    protocol::{ReadyAgent, ServerMessage, send_msg},
};
use crate::state::AppState;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;
use voicebridge_core::{
    error::SessionError,
    session::{SessionEnd, SessionHandle},
    store::EndReason,
};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, agent_id, state))
}

/// Opens the upstream session for `agent_id` and bridges it to the socket.
///
/// Every failure before the bridge starts is reported to the client as an
/// `error` envelope before the socket is closed.
#[instrument(name = "ws_session", skip_all, fields(session_id, agent_id = %agent_id))]
async fn handle_socket(socket: WebSocket, agent_id: String, state: Arc<AppState>) {
    let session_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("session_id", session_id.as_str());
    info!("New WebSocket connection. Opening realtime session...");

    let (mut socket_tx, socket_rx) = socket.split();

    let handle = match open_session(&state, &agent_id, &session_id).await {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            error!(error = %e, status = e.http_status(), "Session initialization failed");
            reject(&mut socket_tx, e.to_string()).await;
            return;
        }
    };

    let ready = ServerMessage::SessionReady {
        session_id: session_id.clone(),
        agent: ReadyAgent::from(handle.agent()),
    };
    if send_msg(&mut socket_tx, &ready).await.is_err() {
        error!("Failed to send session.ready to client.");
        handle
            .close(SessionEnd::new(EndReason::ClientDisconnected))
            .await;
        return;
    }

    let end = run_bridge(socket_tx, socket_rx, handle).await;
    info!(end_reason = %end.reason, "Realtime session finished.");
}

async fn open_session(
    state: &AppState,
    agent_id: &str,
    session_id: &str,
) -> Result<SessionHandle, SessionError> {
    let agent = state.sessions.load_agent(agent_id).await?;
    state.sessions.open(agent, session_id).await
}

/// Sends an `error` envelope and closes the socket.
async fn reject<S>(sink: &mut S, message: String)
where
    S: Sink<Message> + Unpin,
{
    let _ = send_msg(sink, &ServerMessage::Error { error: message }).await;
    let _ = sink.close().await;
}
