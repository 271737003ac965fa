mod common;

use common::{eventually, spawn_server};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use voicebridge_core::store::EndReason;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("socket closed")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// True once the server has closed the socket.
async fn closed_by_server(ws: &mut Client) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => return true,
            Ok(Some(Ok(_))) => continue,
            Err(_) => return false,
        }
    }
}

#[tokio::test]
async fn session_bridges_audio_and_events() {
    let server = spawn_server().await;
    let (mut ws, _) = connect_async(server.ws("/ws/realtime/premium-agent"))
        .await
        .unwrap();

    let ready = next_json(&mut ws).await;
    assert_eq!(ready["type"], "session.ready");
    assert_eq!(ready["agent"]["id"], "premium-agent");
    assert_eq!(ready["agent"]["tier"], "premium");
    assert!(ready["session_id"].as_str().is_some_and(|id| !id.is_empty()));

    let upstream = server.connector.last_upstream().unwrap();
    assert_eq!(upstream.config().voice, "shimmer");
    assert_eq!(upstream.config().tools.len(), 3);

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    assert!(eventually(|| upstream.sent_audio().len() == 1).await);

    upstream.push_event(json!({"type": "response.audio.delta", "delta": "AAAA"}));
    let envelope = next_json(&mut ws).await;
    assert_eq!(envelope["type"], "response.audio.delta");
    assert_eq!(envelope["event"]["delta"], "AAAA");

    ws.close(None).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), upstream.closed())
        .await
        .unwrap();
    assert!(eventually(|| server.store.calls().len() == 1).await);
    assert_eq!(upstream.close_count(), 1);
    assert_eq!(
        server.store.calls()[0].end_reason,
        EndReason::ClientDisconnected
    );
}

#[tokio::test]
async fn end_call_closes_after_the_response() {
    let server = spawn_server().await;
    let (mut ws, _) = connect_async(server.ws("/ws/realtime/premium-agent"))
        .await
        .unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "session.ready");
    let upstream = server.connector.last_upstream().unwrap();

    upstream.push_event(json!({
        "type": "response.function_call_arguments.done",
        "call_id": "call_1",
        "name": "end_call",
        "arguments": "{\"reason\":\"caller_requested\"}",
    }));
    assert_eq!(
        next_json(&mut ws).await["type"],
        "response.function_call_arguments.done"
    );

    upstream.push_event(json!({"type": "response.done"}));
    assert_eq!(next_json(&mut ws).await["type"], "response.done");
    let action = next_json(&mut ws).await;
    assert_eq!(action["type"], "call.action");
    assert_eq!(action["action"]["action"], "end_call");
    assert_eq!(action["action"]["reason"], "caller_requested");

    assert!(closed_by_server(&mut ws).await);
    assert!(eventually(|| server.store.calls().len() == 1).await);
    assert_eq!(server.store.calls()[0].end_reason, EndReason::EndCall);
}

#[tokio::test]
async fn unknown_agent_gets_an_error_envelope() {
    let server = spawn_server().await;
    let (mut ws, _) = connect_async(server.ws("/ws/realtime/nobody"))
        .await
        .unwrap();

    let error = next_json(&mut ws).await;
    assert_eq!(error, json!({"type": "error", "error": "Agent nobody not found"}));
    assert!(closed_by_server(&mut ws).await);
    assert_eq!(server.connector.handshake_count(), 0);
}

#[tokio::test]
async fn basic_tier_is_rejected_before_any_handshake() {
    let server = spawn_server().await;
    let (mut ws, _) = connect_async(server.ws("/ws/realtime/basic-agent"))
        .await
        .unwrap();

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(
        error["error"],
        "Realtime voice is only available for premium tier agents (agent tier: basic)"
    );
    assert!(closed_by_server(&mut ws).await);
    assert_eq!(server.connector.handshake_count(), 0);
}

#[tokio::test]
async fn handshake_failure_is_reported_to_the_client() {
    let server = spawn_server().await;
    server.connector.fail_handshakes_with(401);
    let (mut ws, _) = connect_async(server.ws("/ws/realtime/premium-agent"))
        .await
        .unwrap();

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert!(error["error"].as_str().unwrap().contains("401"));
    assert!(closed_by_server(&mut ws).await);
}
