//! Persistence collaborator seam.
//!
//! The bridge only reads agent configuration and credentials, and writes one
//! call record per session. `AgentStore` is implemented over Postgres by the
//! API service and in memory for tests and local runs.

use crate::{agent::AgentRecord, error::StoreError, tools::IntegrationTool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, PoisonError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ClientDisconnected,
    EndCall,
    TransferCall,
    UpstreamClosed,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::ClientDisconnected => "client_disconnected",
            EndReason::EndCall => "end_call",
            EndReason::TransferCall => "transfer_call",
            EndReason::UpstreamClosed => "upstream_closed",
            EndReason::Error => "error",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Written once per session on teardown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub session_id: String,
    pub agent_id: String,
    pub workspace_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: EndReason,
    pub transfer_destination: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn load_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError>;

    /// The workspace's own realtime API credential, if one is configured.
    async fn workspace_credential(&self, workspace_id: &str)
    -> Result<Option<String>, StoreError>;

    /// Integration tools of `workspace_id` with one of the given ids.
    async fn integration_tools(
        &self,
        workspace_id: &str,
        ids: &[i64],
    ) -> Result<Vec<IntegrationTool>, StoreError>;

    async fn record_call(&self, record: &CallRecord) -> Result<(), StoreError>;
}

/// Store kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryAgentStore {
    agents: Mutex<HashMap<String, AgentRecord>>,
    credentials: Mutex<HashMap<String, String>>,
    tools: Mutex<HashMap<String, Vec<IntegrationTool>>>,
    calls: Mutex<Vec<CallRecord>>,
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_agent(&self, agent: AgentRecord) {
        lock(&self.agents).insert(agent.id.clone(), agent);
    }

    pub fn set_credential(&self, workspace_id: &str, credential: &str) {
        lock(&self.credentials).insert(workspace_id.to_string(), credential.to_string());
    }

    pub fn add_integration_tool(&self, workspace_id: &str, tool: IntegrationTool) {
        lock(&self.tools)
            .entry(workspace_id.to_string())
            .or_default()
            .push(tool);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.calls).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn load_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        Ok(lock(&self.agents).get(agent_id).cloned())
    }

    async fn workspace_credential(
        &self,
        workspace_id: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.credentials).get(workspace_id).cloned())
    }

    async fn integration_tools(
        &self,
        workspace_id: &str,
        ids: &[i64],
    ) -> Result<Vec<IntegrationTool>, StoreError> {
        Ok(lock(&self.tools)
            .get(workspace_id)
            .map(|tools| {
                tools
                    .iter()
                    .filter(|t| ids.contains(&t.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_call(&self, record: &CallRecord) -> Result<(), StoreError> {
        lock(&self.calls).push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(id: i64) -> IntegrationTool {
        IntegrationTool {
            id,
            name: format!("tool_{id}"),
            description: "lookup".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
            endpoint: "https://hooks.example.com/x".to_string(),
        }
    }

    #[tokio::test]
    async fn integration_tools_are_scoped_and_filtered() {
        let store = InMemoryAgentStore::new();
        store.add_integration_tool("ws-1", tool(1));
        store.add_integration_tool("ws-1", tool(2));
        store.add_integration_tool("ws-2", tool(3));

        let tools = store.integration_tools("ws-1", &[2, 3]).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, 2);
        assert!(store.integration_tools("ws-9", &[1]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn credentials_are_per_workspace() {
        let store = InMemoryAgentStore::new();
        store.set_credential("ws-1", "sk-workspace");

        assert_eq!(
            store.workspace_credential("ws-1").await.unwrap().as_deref(),
            Some("sk-workspace")
        );
        assert_eq!(store.workspace_credential("ws-2").await.unwrap(), None);
    }

    #[test]
    fn end_reason_wire_names() {
        assert_eq!(
            serde_json::to_value(EndReason::ClientDisconnected).unwrap(),
            json!("client_disconnected")
        );
        assert_eq!(EndReason::TransferCall.to_string(), "transfer_call");
    }
}
