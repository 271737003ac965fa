//! Voice session lifecycle.
//!
//! `SessionManager` validates an agent snapshot, resolves the API credential,
//! runs the upstream handshake behind the realtime circuit breaker and hands
//! back a `SessionHandle` that exclusively owns the upstream connection.

use crate::{
    agent::AgentConfig,
    error::{ConfigurationError, ResilienceError, SessionError, UpstreamError},
    realtime::{
        RealtimeConnector, RealtimeGrant, RealtimeSession, RealtimeSettings, UPSTREAM_SERVICE,
        UpstreamEvent, UpstreamSessionConfig,
    },
    resilience::{CircuitBreakerRegistry, RetryPolicy},
    store::{AgentStore, CallRecord, EndReason},
    tools::{ToolCatalog, ToolRegistry, webhook_tools},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Ready,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// Used only when the agent's workspace has no credential of its own.
    pub platform_credential: Option<String>,
    pub realtime: RealtimeSettings,
    pub retry: RetryPolicy,
}

/// A validated agent with everything needed to open an upstream session.
#[derive(Clone)]
pub struct PreparedSession {
    pub agent: Arc<AgentConfig>,
    pub tools: ToolRegistry,
    pub upstream_config: UpstreamSessionConfig,
    credential: String,
}

/// How a session ended, as recorded in its `CallRecord`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    pub reason: EndReason,
    pub transfer_destination: Option<String>,
}

impl SessionEnd {
    pub fn new(reason: EndReason) -> Self {
        Self {
            reason,
            transfer_destination: None,
        }
    }

    pub fn transferred(destination: impl Into<String>) -> Self {
        Self {
            reason: EndReason::TransferCall,
            transfer_destination: Some(destination.into()),
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn AgentStore>,
    connector: Arc<dyn RealtimeConnector>,
    breakers: Arc<CircuitBreakerRegistry>,
    catalog: Arc<ToolCatalog>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn AgentStore>,
        connector: Arc<dyn RealtimeConnector>,
        breakers: Arc<CircuitBreakerRegistry>,
        catalog: Arc<ToolCatalog>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            connector,
            breakers,
            catalog,
            settings,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Loads the agent and captures its immutable snapshot.
    pub async fn load_agent(&self, agent_id: &str) -> Result<AgentConfig, SessionError> {
        let record = self
            .store
            .load_agent(agent_id)
            .await?
            .ok_or_else(|| ConfigurationError::AgentNotFound(agent_id.to_string()))?;
        Ok(AgentConfig::snapshot(&record))
    }

    /// Validates `agent` and builds its tools and upstream configuration
    /// without any network I/O to the realtime API.
    pub async fn prepare(&self, agent: AgentConfig) -> Result<PreparedSession, SessionError> {
        if !agent.is_active {
            return Err(ConfigurationError::AgentInactive.into());
        }
        if !agent.tier().is_some_and(|tier| tier.supports_realtime()) {
            return Err(ConfigurationError::IneligibleTier(agent.pricing_tier.clone()).into());
        }
        let credential = self.resolve_credential(&agent).await?;

        let integrations = if agent.enabled_tool_ids.is_empty() {
            HashMap::new()
        } else {
            let specs = self
                .store
                .integration_tools(&agent.workspace_id, &agent.enabled_tool_ids)
                .await?;
            webhook_tools(specs, &self.breakers, self.settings.retry)
        };
        let tools = ToolRegistry::for_agent(&agent, &self.catalog, &integrations);
        let upstream_config = UpstreamSessionConfig::build(
            &agent,
            &tools.all_tool_definitions(),
            &self.settings.realtime,
        );

        info!(
            agent_id = %agent.agent_id,
            tier = %agent.pricing_tier,
            tool_count = upstream_config.tools.len(),
            "Session prepared"
        );
        Ok(PreparedSession {
            agent: Arc::new(agent),
            tools,
            upstream_config,
            credential,
        })
    }

    async fn resolve_credential(&self, agent: &AgentConfig) -> Result<String, SessionError> {
        let workspace = self
            .store
            .workspace_credential(&agent.workspace_id)
            .await?
            .filter(|c| !c.trim().is_empty());
        if let Some(credential) = workspace {
            info!(workspace_id = %agent.workspace_id, "Using workspace API credential");
            return Ok(credential);
        }
        match self
            .settings
            .platform_credential
            .as_ref()
            .filter(|c| !c.trim().is_empty())
        {
            Some(credential) => {
                info!(workspace_id = %agent.workspace_id, "Using platform API credential");
                Ok(credential.clone())
            }
            None => Err(ConfigurationError::MissingCredential.into()),
        }
    }

    /// Opens the upstream session for `agent`.
    ///
    /// The handshake runs inside the realtime circuit breaker; an open
    /// circuit fails without any network I/O. Rejections of the request
    /// itself (4xx other than 429) are returned but do not count against
    /// the circuit.
    pub async fn open(
        &self,
        agent: AgentConfig,
        session_id: impl Into<String>,
    ) -> Result<SessionHandle, SessionError> {
        let session_id = session_id.into();
        let prepared = self.prepare(agent).await?;
        let grant = self.mint_token(&prepared).await?;
        let upstream = self
            .connector
            .connect(&grant, &prepared.upstream_config)
            .await?;

        let handle = SessionHandle::new(
            session_id,
            prepared,
            Arc::from(upstream),
            self.store.clone(),
        );
        handle.mark_ready();
        info!(
            session_id = %handle.id,
            agent_id = %handle.agent.agent_id,
            "Upstream realtime session ready"
        );
        Ok(handle)
    }

    /// Mints an ephemeral client secret for a prepared session.
    pub async fn mint_token(&self, prepared: &PreparedSession) -> Result<RealtimeGrant, SessionError> {
        let breaker = self.breakers.get(UPSTREAM_SERVICE);
        let grant = breaker
            .call_with(
                || {
                    self.connector
                        .create_session(&prepared.credential, &prepared.upstream_config)
                },
                ResilienceError::is_service_failure,
            )
            .await?;
        Ok(grant)
    }

    /// Exchanges a WebRTC SDP offer through the realtime circuit breaker.
    pub async fn negotiate_sdp(
        &self,
        prepared: &PreparedSession,
        offer: Bytes,
    ) -> Result<String, SessionError> {
        let breaker = self.breakers.get(UPSTREAM_SERVICE);
        let answer = breaker
            .call_with(
                || {
                    self.connector
                        .negotiate_sdp(&prepared.credential, offer, &prepared.upstream_config)
                },
                ResilienceError::is_service_failure,
            )
            .await?;
        Ok(answer)
    }
}

/// A live session. Shared by the bridge's two forwarding tasks.
pub struct SessionHandle {
    id: String,
    agent: Arc<AgentConfig>,
    tools: ToolRegistry,
    upstream: Arc<dyn RealtimeSession>,
    store: Arc<dyn AgentStore>,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("agent_id", &self.agent.agent_id)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    fn new(
        id: String,
        prepared: PreparedSession,
        upstream: Arc<dyn RealtimeSession>,
        store: Arc<dyn AgentStore>,
    ) -> Self {
        Self {
            id,
            agent: prepared.agent,
            tools: prepared.tools,
            upstream,
            store,
            started_at: Utc::now(),
            state: Mutex::new(SessionState::Connecting),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> &AgentConfig {
        &self.agent
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Connecting -> Ready, once the upstream accepted the session configuration.
    fn mark_ready(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Connecting {
            *state = SessionState::Ready;
        }
    }

    /// Ready -> Active, once the bridge starts forwarding.
    pub fn activate(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Ready {
            *state = SessionState::Active;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn send_audio(&self, audio: Bytes) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::Closed);
        }
        self.upstream.send_audio(audio).await
    }

    pub async fn send_event(&self, event: Value) -> Result<(), UpstreamError> {
        if self.is_closed() {
            return Err(UpstreamError::Closed);
        }
        self.upstream.send_event(event).await
    }

    pub async fn next_event(&self) -> Option<Result<UpstreamEvent, UpstreamError>> {
        if self.is_closed() {
            return None;
        }
        self.upstream.next_event().await
    }

    /// Closes the upstream and writes the call record. Only the first call
    /// has any effect.
    pub async fn close(&self, end: SessionEnd) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Closing);
        self.upstream.close().await;
        self.set_state(SessionState::Closed);

        let record = CallRecord {
            session_id: self.id.clone(),
            agent_id: self.agent.agent_id.clone(),
            workspace_id: self.agent.workspace_id.clone(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            end_reason: end.reason,
            transfer_destination: end.transfer_destination,
        };
        info!(
            session_id = %self.id,
            agent_id = %self.agent.agent_id,
            end_reason = %record.end_reason,
            "Session closed"
        );
        if let Err(e) = self.store.record_call(&record).await {
            error!(session_id = %self.id, error = %e, "Failed to write call record");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(session_id = %self.id, "Session handle dropped without close");
        let upstream = self.upstream.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { upstream.close().await });
        }
    }
}
