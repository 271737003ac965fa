//! Bidirectional forwarding between a client connection and its upstream
//! realtime session.
//!
//! Two tasks run per session: client -> upstream (audio and control events)
//! and upstream -> client (server events, with tool calls dispatched on the
//! way). The first task to finish cancels the other, then the session is
//! closed and the client sink shut.

use super::protocol::{ClientEvent, ServerMessage};
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::Mutex, task::JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voicebridge_core::{
    error::UpstreamError,
    realtime::{UpstreamEvent, function_call_output, response_create},
    session::{SessionEnd, SessionHandle},
    store::EndReason,
    tools::{CallAction, ToolOutcome},
};

/// The client half that both tasks write to. Nothing is sent after `close`.
struct ClientSink<S> {
    sink: Mutex<S>,
    closed: AtomicBool,
}

impl<S> ClientSink<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    fn new(sink: S) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns false once the client is gone.
    async fn send(&self, msg: Message) -> bool {
        let mut sink = self.sink.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        match sink.send(msg).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Client send failed");
                false
            }
        }
    }

    async fn send_json(&self, value: &Value) -> bool {
        self.send(Message::Text(value.to_string().into())).await
    }

    async fn send_msg(&self, msg: &ServerMessage) -> bool {
        self.send(msg.to_message()).await
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = sink.close().await {
            debug!(error = %e, "Client sink close failed");
        }
    }
}

/// Runs the session until either side stops, then tears everything down.
///
/// Returns how the session ended; the same value is written to the call record.
pub async fn run_bridge<S, R, E>(sink: S, stream: R, handle: Arc<SessionHandle>) -> SessionEnd
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let client = Arc::new(ClientSink::new(sink));
    let cancel = CancellationToken::new();
    handle.activate();

    let mut inbound = tokio::spawn(client_to_upstream(stream, handle.clone(), cancel.clone()));
    let mut outbound = tokio::spawn(upstream_to_client(
        handle.clone(),
        client.clone(),
        cancel.clone(),
    ));

    let end = tokio::select! {
        joined = &mut inbound => {
            outbound.abort();
            finished("client_to_upstream", joined)
        }
        joined = &mut outbound => {
            inbound.abort();
            finished("upstream_to_client", joined)
        }
    };
    cancel.cancel();

    handle.close(end.clone()).await;
    client.close().await;
    info!(session_id = %handle.id(), end_reason = %end.reason, "Bridge finished");
    end
}

fn finished(task: &str, joined: Result<SessionEnd, JoinError>) -> SessionEnd {
    joined.unwrap_or_else(|e| {
        error!(task, error = %e, "Forwarding task failed");
        SessionEnd::new(EndReason::Error)
    })
}

async fn client_to_upstream<R, E>(
    mut stream: R,
    handle: Arc<SessionHandle>,
    cancel: CancellationToken,
) -> SessionEnd
where
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display,
{
    let disconnected = SessionEnd::new(EndReason::ClientDisconnected);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return disconnected,
            next = stream.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!(session_id = %handle.id(), error = %e, "Client connection error");
                return disconnected;
            }
            None => {
                info!(session_id = %handle.id(), "Client disconnected");
                return disconnected;
            }
        };

        match msg {
            Message::Binary(audio) => {
                if let Err(e) = handle.send_audio(audio).await {
                    error!(session_id = %handle.id(), error = %e, "Failed to forward audio upstream");
                    return SessionEnd::new(EndReason::Error);
                }
            }
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    debug!(session_id = %handle.id(), event_type = %event.event_type, "Client control event")
                }
                Err(e) => warn!(session_id = %handle.id(), error = %e, "Malformed client event"),
            },
            Message::Close(frame) => {
                info!(session_id = %handle.id(), ?frame, "Client closed the connection");
                return disconnected;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

async fn upstream_to_client<S>(
    handle: Arc<SessionHandle>,
    client: Arc<ClientSink<S>>,
    cancel: CancellationToken,
) -> SessionEnd
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    let mut pending: Option<CallAction> = None;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::new(EndReason::ClientDisconnected),
            next = handle.next_event() => next,
        };
        let event = match next {
            Some(Ok(event)) => event,
            Some(Err(e)) if !e.is_fatal() => {
                warn!(session_id = %handle.id(), error = %e, "Skipping unreadable upstream event");
                continue;
            }
            Some(Err(e)) => {
                error!(session_id = %handle.id(), error = %e, "Upstream connection failed");
                client
                    .send_msg(&ServerMessage::Error {
                        error: format!("Upstream connection failed: {e}"),
                    })
                    .await;
                return SessionEnd::new(EndReason::Error);
            }
            None => {
                info!(session_id = %handle.id(), "Upstream session closed");
                client
                    .send_msg(&ServerMessage::Error {
                        error: "Upstream session closed".to_string(),
                    })
                    .await;
                return SessionEnd::new(EndReason::UpstreamClosed);
            }
        };

        if let Err(e) = dispatch_tool_call(&handle, &client, &event, &mut pending).await {
            error!(session_id = %handle.id(), error = %e, "Failed to return tool result upstream");
            return SessionEnd::new(EndReason::Error);
        }

        if !client.send_json(&event.client_envelope()).await {
            return SessionEnd::new(EndReason::ClientDisconnected);
        }

        if !event.is_response_done() {
            continue;
        }
        if let Some(action) = pending.take() {
            info!(session_id = %handle.id(), action = action.name(), "Carrying out call action");
            let end = match &action {
                CallAction::TransferCall { destination, .. } => {
                    SessionEnd::transferred(destination.clone())
                }
                _ => SessionEnd::new(EndReason::EndCall),
            };
            client.send_msg(&ServerMessage::CallAction { action }).await;
            return end;
        }
    }
}

/// Routes a completed function call through the registry and returns the
/// result to the model. A successful end or transfer is held in `pending`
/// until the current response finishes.
async fn dispatch_tool_call<S>(
    handle: &SessionHandle,
    client: &ClientSink<S>,
    event: &UpstreamEvent,
    pending: &mut Option<CallAction>,
) -> Result<(), UpstreamError>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    let Some(call) = event.tool_call() else {
        return Ok(());
    };

    let (call_id, outcome) = match call {
        Ok(call) => {
            info!(session_id = %handle.id(), tool = %call.name, call_id = %call.call_id, "Tool call");
            let outcome = handle.tools().execute_tool(&call.name, &call.arguments).await;
            (call.call_id, outcome)
        }
        Err(reason) => {
            warn!(session_id = %handle.id(), error = %reason, "Undecodable tool call");
            let Some(call_id) = event.payload.get("call_id").and_then(Value::as_str) else {
                return Ok(());
            };
            (call_id.to_string(), ToolOutcome::Failure(reason))
        }
    };

    handle
        .send_event(function_call_output(&call_id, &outcome.to_json()))
        .await?;

    match outcome.action() {
        Some(action) if action.ends_session() => {
            *pending = Some(action.clone());
            return Ok(());
        }
        Some(action) => {
            client
                .send_msg(&ServerMessage::CallAction {
                    action: action.clone(),
                })
                .await;
        }
        None => {}
    }
    handle.send_event(response_create()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use serde_json::json;
    use std::time::Duration;
    use voicebridge_core::{
        agent::{AgentConfig, AgentRecord, CALL_CONTROL_TOOLSET},
        realtime::{FUNCTION_CALL_ARGUMENTS_DONE, RESPONSE_DONE},
        resilience::CircuitBreakerRegistry,
        scripted::{ScriptedConnector, ScriptedUpstream},
        session::{SessionManager, SessionSettings},
        store::InMemoryAgentStore,
        tools::ToolCatalog,
    };

    type ClientTx = mpsc::UnboundedSender<Result<Message, axum::Error>>;
    type ClientRx = mpsc::UnboundedReceiver<Message>;

    struct Call {
        store: Arc<InMemoryAgentStore>,
        upstream: Arc<ScriptedUpstream>,
        handle: Arc<SessionHandle>,
        client_tx: ClientTx,
        client_rx: ClientRx,
        bridge: tokio::task::JoinHandle<SessionEnd>,
    }

    async fn start_call() -> Call {
        let store = Arc::new(InMemoryAgentStore::new());
        store.insert_agent(AgentRecord {
            id: "agent-1".to_string(),
            workspace_id: "ws-1".to_string(),
            name: "Front Desk".to_string(),
            is_active: true,
            pricing_tier: "premium".to_string(),
            system_prompt: None,
            language: None,
            voice: None,
            enabled_tools: vec![CALL_CONTROL_TOOLSET.to_string()],
            enabled_tool_ids: vec![],
            turn_detection: None,
        });
        let connector = Arc::new(ScriptedConnector::new());
        let manager = SessionManager::new(
            store.clone(),
            connector.clone(),
            Arc::new(CircuitBreakerRegistry::default()),
            Arc::new(ToolCatalog::new()),
            SessionSettings {
                platform_credential: Some("sk-platform".to_string()),
                ..SessionSettings::default()
            },
        );
        let agent: AgentConfig = manager.load_agent("agent-1").await.unwrap();
        let handle = Arc::new(manager.open(agent, "session-1").await.unwrap());
        let upstream = connector.last_upstream().unwrap();

        let (client_tx, inbound) = mpsc::unbounded();
        let (outbound, client_rx) = mpsc::unbounded();
        let bridge = tokio::spawn(run_bridge(outbound, inbound, handle.clone()));
        Call {
            store,
            upstream,
            handle,
            client_tx,
            client_rx,
            bridge,
        }
    }

    fn function_call(name: &str, arguments: Value) -> Value {
        json!({
            "type": FUNCTION_CALL_ARGUMENTS_DONE,
            "call_id": format!("call_{name}"),
            "name": name,
            "arguments": arguments.to_string(),
        })
    }

    async fn next_json(rx: &mut ClientRx) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.next())
            .await
            .expect("timed out waiting for a client message")
            .expect("client channel closed");
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected client message: {other:?}"),
        }
    }

    async fn finish(bridge: tokio::task::JoinHandle<SessionEnd>) -> SessionEnd {
        tokio::time::timeout(Duration::from_secs(5), bridge)
            .await
            .expect("bridge did not finish")
            .unwrap()
    }

    fn sent_types(upstream: &ScriptedUpstream) -> Vec<String> {
        upstream
            .sent_events()
            .iter()
            .map(|e| e["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn audio_is_forwarded_and_disconnect_tears_down_once() {
        let mut call = start_call().await;
        call.client_tx
            .unbounded_send(Ok(Message::Binary(bytes::Bytes::from_static(b"\x01\x02"))))
            .unwrap();
        call.client_tx
            .unbounded_send(Ok(Message::Text(r#"{"type":"ping"}"#.into())))
            .unwrap();
        drop(call.client_tx);

        let end = finish(call.bridge).await;
        assert_eq!(end.reason, EndReason::ClientDisconnected);
        assert_eq!(call.upstream.sent_audio(), vec![bytes::Bytes::from_static(b"\x01\x02")]);
        assert!(call.upstream.sent_events().is_empty());
        assert_eq!(call.upstream.close_count(), 1);
        assert!(call.handle.is_closed());

        // Nothing reaches the client after teardown.
        call.upstream.push_event(json!({"type": "response.audio.delta"}));
        assert!(call.client_rx.next().await.is_none());

        let records = call.store.calls();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].end_reason, EndReason::ClientDisconnected);
    }

    #[tokio::test]
    async fn events_are_forwarded_in_envelopes() {
        let mut call = start_call().await;
        call.upstream
            .push_event(json!({"type": "response.audio.delta", "delta": "AAAA"}));

        let envelope = next_json(&mut call.client_rx).await;
        assert_eq!(
            envelope,
            json!({
                "type": "response.audio.delta",
                "event": {"type": "response.audio.delta", "delta": "AAAA"}
            })
        );
        drop(call.client_tx);
        finish(call.bridge).await;
    }

    #[tokio::test]
    async fn end_call_waits_for_the_response_to_finish() {
        let mut call = start_call().await;
        call.upstream
            .push_event(function_call("end_call", json!({"reason": "caller_requested"})));

        let envelope = next_json(&mut call.client_rx).await;
        assert_eq!(envelope["type"], FUNCTION_CALL_ARGUMENTS_DONE);
        assert!(!call.handle.is_closed());

        let output = &call.upstream.sent_events()[0];
        assert_eq!(output["item"]["call_id"], "call_end_call");
        let result: Value =
            serde_json::from_str(output["item"]["output"].as_str().unwrap()).unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["action"], "end_call");
        assert_eq!(result["reason"], "caller_requested");
        assert_eq!(sent_types(&call.upstream), vec!["conversation.item.create"]);

        call.upstream.push_event(json!({"type": RESPONSE_DONE}));
        assert_eq!(next_json(&mut call.client_rx).await["type"], RESPONSE_DONE);
        let action = next_json(&mut call.client_rx).await;
        assert_eq!(action["type"], "call.action");
        assert_eq!(action["action"]["action"], "end_call");

        let end = finish(call.bridge).await;
        assert_eq!(end.reason, EndReason::EndCall);
        assert_eq!(call.upstream.close_count(), 1);
        assert_eq!(call.store.calls()[0].end_reason, EndReason::EndCall);
    }

    #[tokio::test]
    async fn transfer_records_its_destination() {
        let mut call = start_call().await;
        call.upstream.push_event(function_call(
            "transfer_call",
            json!({"destination": "+15550100"}),
        ));
        call.upstream.push_event(json!({"type": RESPONSE_DONE}));

        let end = finish(call.bridge).await;
        assert_eq!(end, SessionEnd::transferred("+15550100"));

        let mut actions = Vec::new();
        while let Some(Message::Text(text)) = call.client_rx.next().await {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "call.action" {
                actions.push(value);
            }
        }
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0]["action"]["destination"], "+15550100");
        let record = &call.store.calls()[0];
        assert_eq!(record.transfer_destination.as_deref(), Some("+15550100"));
    }

    #[tokio::test]
    async fn invalid_transfer_keeps_the_call_going() {
        let mut call = start_call().await;
        call.upstream
            .push_event(function_call("transfer_call", json!({"destination": ""})));
        call.upstream.push_event(json!({"type": RESPONSE_DONE}));

        next_json(&mut call.client_rx).await;
        assert_eq!(next_json(&mut call.client_rx).await["type"], RESPONSE_DONE);
        assert!(!call.handle.is_closed());

        let events = call.upstream.sent_events();
        let result: Value =
            serde_json::from_str(events[0]["item"]["output"].as_str().unwrap()).unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "Destination is required for transfer");
        assert_eq!(events[1]["type"], "response.create");

        drop(call.client_tx);
        finish(call.bridge).await;
    }

    #[tokio::test]
    async fn dtmf_is_sent_to_the_client_immediately() {
        let mut call = start_call().await;
        call.upstream
            .push_event(function_call("send_dtmf", json!({"digits": "123*#w"})));

        let action = next_json(&mut call.client_rx).await;
        assert_eq!(action["type"], "call.action");
        assert_eq!(action["action"]["action"], "send_dtmf");
        assert_eq!(action["action"]["digits"], "123*#w");
        assert_eq!(action["action"]["duration_ms"], 250);
        assert_eq!(
            next_json(&mut call.client_rx).await["type"],
            FUNCTION_CALL_ARGUMENTS_DONE
        );
        assert_eq!(
            sent_types(&call.upstream),
            vec!["conversation.item.create", "response.create"]
        );
        assert!(!call.handle.is_closed());

        drop(call.client_tx);
        finish(call.bridge).await;
    }

    #[tokio::test]
    async fn unknown_tool_reports_failure_to_the_model() {
        let mut call = start_call().await;
        call.upstream
            .push_event(function_call("lookup_order", json!({"id": 7})));
        next_json(&mut call.client_rx).await;

        let events = call.upstream.sent_events();
        let result: Value =
            serde_json::from_str(events[0]["item"]["output"].as_str().unwrap()).unwrap();
        assert_eq!(result, json!({"success": false, "error": "unknown tool"}));
        assert_eq!(events[1]["type"], "response.create");

        drop(call.client_tx);
        finish(call.bridge).await;
    }

    #[tokio::test]
    async fn malformed_arguments_fail_the_call_not_the_session() {
        let mut call = start_call().await;
        call.upstream.push_event(json!({
            "type": FUNCTION_CALL_ARGUMENTS_DONE,
            "call_id": "call_bad",
            "name": "end_call",
            "arguments": "{not json",
        }));
        next_json(&mut call.client_rx).await;

        let events = call.upstream.sent_events();
        assert_eq!(events[0]["item"]["call_id"], "call_bad");
        let result: Value =
            serde_json::from_str(events[0]["item"]["output"].as_str().unwrap()).unwrap();
        assert_eq!(result["success"], false);
        assert!(!call.handle.is_closed());

        drop(call.client_tx);
        finish(call.bridge).await;
    }

    #[tokio::test]
    async fn upstream_hang_up_reports_error_and_closes_client() {
        let mut call = start_call().await;
        call.upstream.hang_up();

        let error = next_json(&mut call.client_rx).await;
        assert_eq!(error["type"], "error");
        let end = finish(call.bridge).await;
        assert_eq!(end.reason, EndReason::UpstreamClosed);
        assert!(call.client_rx.next().await.is_none());
        assert_eq!(call.upstream.close_count(), 1);
    }

    #[tokio::test]
    async fn transport_failure_ends_the_session_with_an_error() {
        let mut call = start_call().await;
        call.upstream
            .push_error(UpstreamError::Protocol("connection reset".to_string()));

        let error = next_json(&mut call.client_rx).await;
        assert_eq!(error["type"], "error");
        assert!(
            error["error"]
                .as_str()
                .unwrap()
                .starts_with("Upstream connection failed")
        );

        let end = finish(call.bridge).await;
        assert_eq!(end.reason, EndReason::Error);
        assert!(call.client_rx.next().await.is_none());
        assert_eq!(call.upstream.close_count(), 1);
        assert_eq!(call.store.calls()[0].end_reason, EndReason::Error);
    }

    #[tokio::test]
    async fn unreadable_upstream_event_is_skipped() {
        let mut call = start_call().await;
        call.upstream
            .push_error(UpstreamError::Decode("expected value at line 1".to_string()));
        call.upstream
            .push_event(json!({"type": "response.audio.delta", "delta": "AAAA"}));

        let envelope = next_json(&mut call.client_rx).await;
        assert_eq!(envelope["type"], "response.audio.delta");
        assert!(!call.handle.is_closed());
        assert_eq!(call.upstream.close_count(), 0);

        drop(call.client_tx);
        let end = finish(call.bridge).await;
        assert_eq!(end.reason, EndReason::ClientDisconnected);
    }
}
