//! Webhook-backed data-lookup tools configured per workspace.

use super::{ExternalTool, ToolDefinition, ToolParameters};
use crate::{
    error::ResilienceError,
    resilience::{CircuitBreaker, CircuitBreakerRegistry, OutboundRequest, ResilientClient, RetryPolicy},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

/// An integration tool row as stored by the configuration collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationTool {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
    pub endpoint: String,
}

/// Executes an `IntegrationTool` by POSTing `{tool, arguments}` to its endpoint.
///
/// Calls go through the breaker named after the endpoint host, so every tool
/// hosted on the same backend shares one failure budget. Requests the
/// backend rejects as invalid (4xx other than 429) do not spend it.
pub struct WebhookTool {
    spec: IntegrationTool,
    client: ResilientClient,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl WebhookTool {
    pub fn new(
        spec: IntegrationTool,
        breakers: &CircuitBreakerRegistry,
        policy: RetryPolicy,
    ) -> Result<Self, ResilienceError> {
        let host = reqwest::Url::parse(&spec.endpoint)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .and_then(|url| url.host_str().map(str::to_string))
            .ok_or_else(|| ResilienceError::InvalidRequest {
                service: spec.name.clone(),
                message: format!("invalid endpoint '{}'", spec.endpoint),
            })?;
        let client = ResilientClient::new(host.clone(), spec.endpoint.clone())?;
        Ok(Self {
            spec,
            client,
            breaker: breakers.get(&host),
            policy,
        })
    }

    pub fn service(&self) -> &str {
        self.breaker.name()
    }
}

#[async_trait]
impl ExternalTool for WebhookTool {
    fn definition(&self) -> ToolDefinition {
        let parameters = serde_json::from_value::<ToolParameters>(self.spec.parameters.clone())
            .unwrap_or_else(|_| ToolParameters {
                kind: "object".to_string(),
                properties: Map::new(),
                required: Vec::new(),
            });
        ToolDefinition {
            kind: "function".to_string(),
            name: self.spec.name.clone(),
            description: self.spec.description.clone(),
            parameters,
        }
    }

    async fn execute(&self, arguments: &Map<String, Value>) -> anyhow::Result<Value> {
        let request = OutboundRequest::post_json(
            self.spec.endpoint.clone(),
            json!({ "tool": self.spec.name, "arguments": arguments }),
        );
        let response = self
            .breaker
            .call_with(
                || self.client.request_with_retry(&request, &self.policy),
                ResilienceError::is_service_failure,
            )
            .await?;

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Builds executable tools keyed by integration id. Rows with unusable
/// endpoints are skipped.
pub fn webhook_tools(
    specs: Vec<IntegrationTool>,
    breakers: &CircuitBreakerRegistry,
    policy: RetryPolicy,
) -> HashMap<i64, Arc<dyn ExternalTool>> {
    let mut tools: HashMap<i64, Arc<dyn ExternalTool>> = HashMap::new();
    for spec in specs {
        let id = spec.id;
        match WebhookTool::new(spec, breakers, policy) {
            Ok(tool) => {
                tools.insert(id, Arc::new(tool));
            }
            Err(e) => warn!(tool_id = id, error = %e, "Skipping integration tool"),
        }
    }
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{BreakerSettings, CircuitState};
    use axum::{Json, Router, http::StatusCode, routing::post};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn lookup(Json(body): Json<Value>) -> Json<Value> {
        Json(json!({ "customer": body["arguments"]["phone"], "tool": body["tool"] }))
    }

    async fn broken() -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    async fn invalid() -> StatusCode {
        StatusCode::UNPROCESSABLE_ENTITY
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/lookup", post(lookup))
            .route("/broken", post(broken))
            .route("/invalid", post(invalid));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn spec(endpoint: String) -> IntegrationTool {
        IntegrationTool {
            id: 7,
            name: "crm_lookup".to_string(),
            description: "Find a customer by phone number".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"phone": {"type": "string"}},
                "required": ["phone"]
            }),
            endpoint,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            backoff_factor: 2.0,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn definition_uses_stored_schema() {
        let registry = CircuitBreakerRegistry::default();
        let tool = WebhookTool::new(spec("https://crm.example.com/hook".into()), &registry, policy())
            .unwrap();
        let def = tool.definition();
        assert_eq!(def.name, "crm_lookup");
        assert_eq!(def.parameters.required, vec!["phone".to_string()]);
        assert_eq!(tool.service(), "crm.example.com");
    }

    #[test]
    fn rejects_non_http_endpoints() {
        let registry = CircuitBreakerRegistry::default();
        assert!(WebhookTool::new(spec("ftp://crm.example.com".into()), &registry, policy()).is_err());
        assert!(WebhookTool::new(spec("not a url".into()), &registry, policy()).is_err());
        assert!(webhook_tools(vec![spec("nope".into())], &registry, policy()).is_empty());
    }

    #[tokio::test]
    async fn posts_arguments_and_returns_json() {
        let base = serve().await;
        let registry = CircuitBreakerRegistry::default();
        let tool = WebhookTool::new(spec(format!("{base}/lookup")), &registry, policy()).unwrap();

        let mut args = Map::new();
        args.insert("phone".to_string(), json!("+15550001111"));
        let result = tool.execute(&args).await.unwrap();

        assert_eq!(result, json!({"customer": "+15550001111", "tool": "crm_lookup"}));
    }

    #[tokio::test]
    async fn failures_count_against_the_host_breaker() {
        let base = serve().await;
        let registry = CircuitBreakerRegistry::new(BreakerSettings {
            failure_threshold: 2,
            open_timeout: Duration::from_secs(60),
        });
        let tool = WebhookTool::new(spec(format!("{base}/broken")), &registry, policy()).unwrap();

        assert!(tool.execute(&Map::new()).await.is_err());
        assert!(tool.execute(&Map::new()).await.is_err());

        let snapshot = registry.get("127.0.0.1").state();
        assert_eq!(snapshot.state, CircuitState::Open);

        let err = tool.execute(&Map::new()).await.unwrap_err();
        assert!(err.to_string().contains("is OPEN"));
    }

    #[tokio::test]
    async fn rejected_arguments_do_not_count_against_the_host_breaker() {
        let base = serve().await;
        let registry = CircuitBreakerRegistry::new(BreakerSettings {
            failure_threshold: 2,
            open_timeout: Duration::from_secs(60),
        });
        let tool = WebhookTool::new(spec(format!("{base}/invalid")), &registry, policy()).unwrap();

        for _ in 0..3 {
            let err = tool.execute(&Map::new()).await.unwrap_err();
            assert!(err.to_string().contains("422"));
        }
        let snapshot = registry.get("127.0.0.1").state();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }
}
