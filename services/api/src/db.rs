//! Data Access Layer
//!
//! `Db` implements the core `AgentStore` over the persistence collaborator's
//! PostgreSQL tables. The schema belongs to the CRUD service, so queries are
//! checked at runtime rather than against a local migration set.

use async_trait::async_trait;
use sqlx::PgPool;
use voicebridge_core::{
    agent::AgentRecord,
    error::StoreError,
    store::{AgentStore, CallRecord},
    tools::IntegrationTool,
};

use crate::models::{AgentRow, IntegrationToolRow};

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Round-trips a trivial query, for readiness checks.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl AgentStore for Db {
    async fn load_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let row = sqlx::query_as::<_, AgentRow>(
            r#"
            SELECT id::text AS id,
                   workspace_id::text AS workspace_id,
                   name,
                   is_active,
                   pricing_tier,
                   system_prompt,
                   language,
                   voice,
                   COALESCE(enabled_tools, '{}') AS enabled_tools,
                   COALESCE(enabled_tool_ids, '{}') AS enabled_tool_ids,
                   turn_detection
            FROM agents
            WHERE id::text = $1
            "#,
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(AgentRecord::from))
    }

    async fn workspace_credential(
        &self,
        workspace_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let key: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT openai_api_key FROM workspace_settings WHERE workspace_id::text = $1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(key.and_then(|(k,)| k))
    }

    async fn integration_tools(
        &self,
        workspace_id: &str,
        ids: &[i64],
    ) -> Result<Vec<IntegrationTool>, StoreError> {
        let rows = sqlx::query_as::<_, IntegrationToolRow>(
            r#"
            SELECT id, name, description, parameters, endpoint
            FROM integration_tools
            WHERE workspace_id::text = $1 AND id = ANY($2) AND is_enabled
            ORDER BY id
            "#,
        )
        .bind(workspace_id)
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(IntegrationTool::from).collect())
    }

    async fn record_call(&self, record: &CallRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO call_records
                (session_id, agent_id, workspace_id, started_at, ended_at, end_reason, transfer_destination)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.agent_id)
        .bind(&record.workspace_id)
        .bind(record.started_at)
        .bind(record.ended_at)
        .bind(record.end_reason.as_str())
        .bind(record.transfer_destination.as_deref())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
