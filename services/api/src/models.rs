//! API and Database Models
//!
//! Rows read from the persistence collaborator's tables with `sqlx`, and the
//! REST payloads documented with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use utoipa::ToSchema;
use voicebridge_core::{
    agent::{AgentConfig, AgentRecord, TurnDetection},
    resilience::BreakerSnapshot,
    tools::IntegrationTool,
};

#[derive(FromRow, Debug, Clone)]
pub struct AgentRow {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub is_active: bool,
    pub pricing_tier: String,
    pub system_prompt: Option<String>,
    pub language: Option<String>,
    pub voice: Option<String>,
    pub enabled_tools: Vec<String>,
    pub enabled_tool_ids: Vec<i64>,
    pub turn_detection: Option<sqlx::types::Json<TurnDetection>>,
}

impl From<AgentRow> for AgentRecord {
    fn from(row: AgentRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            is_active: row.is_active,
            pricing_tier: row.pricing_tier,
            system_prompt: row.system_prompt,
            language: row.language,
            voice: row.voice,
            enabled_tools: row.enabled_tools,
            enabled_tool_ids: row.enabled_tool_ids,
            turn_detection: row.turn_detection.map(|j| j.0),
        }
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct IntegrationToolRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub endpoint: String,
}

impl From<IntegrationToolRow> for IntegrationTool {
    fn from(row: IntegrationToolRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            parameters: row.parameters,
            endpoint: row.endpoint,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub app: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct BreakerStatus {
    pub name: String,
    #[schema(example = "closed")]
    pub state: String,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl From<BreakerSnapshot> for BreakerStatus {
    fn from(snapshot: BreakerSnapshot) -> Self {
        let state = serde_json::to_value(snapshot.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            name: snapshot.name,
            state,
            failure_count: snapshot.failure_count,
            failure_threshold: snapshot.failure_threshold,
            open_timeout_secs: snapshot.open_timeout_secs,
            last_failure_at: snapshot.last_failure_at,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct BreakerResetResponse {
    pub name: String,
    pub reset: bool,
}

/// Agent details returned alongside an ephemeral token.
#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub tier: String,
    pub system_prompt: String,
    pub language: Option<String>,
    pub voice: String,
    pub instructions: String,
    pub enabled_tools: Vec<String>,
}

impl From<&AgentConfig> for AgentSummary {
    fn from(agent: &AgentConfig) -> Self {
        Self {
            id: agent.agent_id.clone(),
            name: agent.name.clone(),
            tier: agent.pricing_tier.clone(),
            system_prompt: agent.system_prompt.clone(),
            language: agent.language.clone(),
            voice: agent.voice.clone(),
            instructions: agent.instructions.clone(),
            enabled_tools: agent.enabled_tools.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct TokenResponse {
    /// The upstream `client_secret` object (`value`, `expires_at`).
    #[schema(value_type = Object)]
    pub client_secret: Value,
    pub agent: AgentSummary,
    #[schema(value_type = Object)]
    pub session_config: Value,
    #[schema(value_type = Vec<Object>)]
    pub tools: Value,
}
