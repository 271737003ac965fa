//! Runs the full router on an ephemeral port with an in-memory agent store and
//! a scripted upstream.

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::Level;
use voicebridge_api::{config::Config, router::create_router, state::AppState};
use voicebridge_core::{
    agent::{AgentRecord, CALL_CONTROL_TOOLSET},
    resilience::{BreakerSettings, CircuitBreakerRegistry, RetryPolicy},
    scripted::ScriptedConnector,
    session::{SessionManager, SessionSettings},
    store::InMemoryAgentStore,
    tools::ToolCatalog,
};

pub const BREAKER_THRESHOLD: u32 = 2;

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<InMemoryAgentStore>,
    pub connector: Arc<ScriptedConnector>,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

pub fn agent(id: &str, tier: &str) -> AgentRecord {
    AgentRecord {
        id: id.to_string(),
        workspace_id: "ws-1".to_string(),
        name: "Front Desk".to_string(),
        is_active: true,
        pricing_tier: tier.to_string(),
        system_prompt: Some("Answer the phone politely.".to_string()),
        language: Some("en".to_string()),
        voice: None,
        enabled_tools: vec![CALL_CONTROL_TOOLSET.to_string()],
        enabled_tool_ids: vec![],
        turn_detection: None,
    }
}

fn config(addr: SocketAddr) -> Config {
    Config {
        bind_address: addr,
        database_url: "postgresql://unused".to_string(),
        openai_api_key: Some("sk-platform".to_string()),
        openai_base_url: "http://127.0.0.1:1".to_string(),
        realtime_ws_url: "ws://127.0.0.1:1/v1/realtime".to_string(),
        realtime_model: "gpt-4o-realtime-preview-2024-12-17".to_string(),
        voice_speed: 1.15,
        http_timeout: Duration::from_secs(5),
        http_max_retries: 1,
        http_backoff_factor: 2.0,
        breaker_failure_threshold: BREAKER_THRESHOLD,
        breaker_open_timeout: Duration::from_secs(60),
        log_level: Level::INFO,
    }
}

pub async fn spawn_server() -> TestServer {
    let store = Arc::new(InMemoryAgentStore::new());
    store.insert_agent(agent("premium-agent", "premium"));
    store.insert_agent(agent("basic-agent", "basic"));
    let connector = Arc::new(ScriptedConnector::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = config(addr);

    let sessions = SessionManager::new(
        store.clone(),
        connector.clone(),
        Arc::new(CircuitBreakerRegistry::new(BreakerSettings {
            failure_threshold: config.breaker_failure_threshold,
            open_timeout: config.breaker_open_timeout,
        })),
        Arc::new(ToolCatalog::new()),
        SessionSettings {
            platform_credential: config.openai_api_key.clone(),
            realtime: config.realtime_settings(),
            retry: RetryPolicy::default(),
        },
    );
    let app = create_router(Arc::new(AppState::new(sessions, config)));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        store,
        connector,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
