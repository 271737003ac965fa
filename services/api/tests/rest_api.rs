mod common;

use common::{BREAKER_THRESHOLD, spawn_server};
use reqwest::StatusCode;
use serde_json::Value;

#[tokio::test]
async fn health_reports_the_service() {
    let server = spawn_server().await;
    let body: Value = reqwest::get(server.http("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["app"], "voicebridge-api");
}

#[tokio::test]
async fn token_carries_secret_agent_and_tools() {
    let server = spawn_server().await;
    let response = reqwest::get(server.http("/api/v1/realtime/token/premium-agent"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["client_secret"]["value"], "ek_scripted_1");
    assert_eq!(body["agent"]["id"], "premium-agent");
    assert_eq!(body["agent"]["tier"], "premium");
    assert_eq!(body["agent"]["voice"], "shimmer");
    assert_eq!(body["session_config"]["tool_choice"], "auto");
    let names: Vec<&str> = body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["end_call", "transfer_call", "send_dtmf"]);
    assert_eq!(server.connector.credentials(), vec!["sk-platform"]);
}

#[tokio::test]
async fn token_errors_keep_their_status() {
    let server = spawn_server().await;

    let missing = reqwest::get(server.http("/api/v1/realtime/token/nobody"))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["message"], "Agent nobody not found");

    let basic = reqwest::get(server.http("/api/v1/realtime/token/basic-agent"))
        .await
        .unwrap();
    assert_eq!(basic.status(), StatusCode::BAD_REQUEST);
    let body: Value = basic.json().await.unwrap();
    assert_eq!(
        body["message"],
        "Realtime voice is only available for premium tier agents (agent tier: basic)"
    );
    assert_eq!(server.connector.handshake_count(), 0);
}

#[tokio::test]
async fn webrtc_offer_returns_sdp_answer() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.http("/api/v1/realtime/session/premium-agent"))
        .header("content-type", "application/sdp")
        .body("v=0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/sdp"
    );
    assert_eq!(response.text().await.unwrap(), "answer-for:v=0");

    let empty = client
        .post(server.http("/api/v1/realtime/session/premium-agent"))
        .body("")
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    assert_eq!(server.connector.handshake_count(), 1);
}

#[tokio::test]
async fn failing_upstream_opens_the_breaker_until_reset() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();
    server.connector.fail_handshakes_with(500);

    for _ in 0..BREAKER_THRESHOLD {
        let response = client
            .get(server.http("/api/v1/realtime/token/premium-agent"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    let rejected = client
        .get(server.http("/api/v1/realtime/token/premium-agent"))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(server.connector.handshake_count(), BREAKER_THRESHOLD as usize);

    let breakers: Value = client
        .get(server.http("/api/v1/resilience/breakers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let realtime = breakers
        .as_array()
        .unwrap()
        .iter()
        .find(|b| b["name"] == "openai_realtime")
        .unwrap();
    assert_eq!(realtime["state"], "open");

    let reset = client
        .post(server.http("/api/v1/resilience/breakers/openai_realtime/reset"))
        .send()
        .await
        .unwrap();
    assert_eq!(reset.status(), StatusCode::OK);
    let unknown = client
        .post(server.http("/api/v1/resilience/breakers/nope/reset"))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let retried = client
        .get(server.http("/api/v1/realtime/token/premium-agent"))
        .send()
        .await
        .unwrap();
    assert_eq!(retried.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        server.connector.handshake_count(),
        BREAKER_THRESHOLD as usize + 1
    );
}
