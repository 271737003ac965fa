//! Tools exposed to the realtime voice model.
//!
//! A `ToolRegistry` is built once per session from the agent snapshot and is
//! read-only afterwards. Call-control tools are handled in-process; every
//! other tool is an `ExternalTool`.
//!
//! Agents reach external tools in two ways: by integration id (webhook rows
//! from the store) or by name through a `ToolCatalog` the embedding host
//! fills. The bundled API server registers no named tools, so there only
//! `call_control` and integration ids resolve.

pub mod call_control;
pub mod integration;

pub use call_control::{CallAction, CallControlTools, ToolInvocation};
pub use integration::{IntegrationTool, WebhookTool, webhook_tools};

use crate::agent::{AgentConfig, CALL_CONTROL_TOOLSET};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// A function tool in the shape the realtime API expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
}

impl ToolDefinition {
    /// `properties` must be a JSON object; anything else yields no properties.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: Value,
        required: &[&str],
    ) -> Self {
        let properties = match properties {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: "function".to_string(),
            name: name.into(),
            description: description.into(),
            parameters: ToolParameters {
                kind: "object".to_string(),
                properties,
                required: required.iter().map(|r| r.to_string()).collect(),
            },
        }
    }
}

/// A function call issued by the model, as received from upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallEvent {
    pub call_id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Structured result of executing a tool. Never an `Err`: failures are data
/// the model can read.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Action(CallAction),
    Data(Value),
    Failure(String),
}

impl ToolOutcome {
    pub fn unknown() -> Self {
        ToolOutcome::Failure("unknown tool".to_string())
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ToolOutcome::Failure(_))
    }

    pub fn action(&self) -> Option<&CallAction> {
        match self {
            ToolOutcome::Action(action) => Some(action),
            _ => None,
        }
    }

    /// `{success, action?, ...}` as returned to the model.
    pub fn to_json(&self) -> Value {
        match self {
            ToolOutcome::Action(action) => {
                let mut body = match serde_json::to_value(action) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                body.insert("success".to_string(), Value::Bool(true));
                body.insert("message".to_string(), Value::String(action.message()));
                Value::Object(body)
            }
            ToolOutcome::Data(data) => json!({ "success": true, "result": data }),
            ToolOutcome::Failure(error) => json!({ "success": false, "error": error }),
        }
    }
}

/// A tool whose work happens outside the session, typically a data lookup.
#[async_trait]
pub trait ExternalTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, arguments: &Map<String, Value>) -> anyhow::Result<Value>;
}

/// Host-provided tools addressable by name from an agent's enabled tool list.
///
/// Names with no entry are skipped when a registry is built.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, Arc<dyn ExternalTool>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ExternalTool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExternalTool>> {
        self.tools.get(name).cloned()
    }
}

enum RegisteredTool {
    CallControl,
    External(Arc<dyn ExternalTool>),
}

/// Per-session set of callable tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    definitions: Arc<[ToolDefinition]>,
    handlers: Arc<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    /// Builds the registry in a deterministic order: enabled names in agent
    /// order (`call_control` expands to its three tools), then integration
    /// tools in id order. Names that resolve to nothing are skipped.
    pub fn build(
        enabled_tool_names: &[String],
        enabled_tool_ids: &[i64],
        catalog: &ToolCatalog,
        integrations: &HashMap<i64, Arc<dyn ExternalTool>>,
    ) -> Self {
        let mut definitions = Vec::new();
        let mut handlers = HashMap::new();

        let mut add = |definition: ToolDefinition, handler: RegisteredTool| {
            if handlers.contains_key(&definition.name) {
                warn!(tool = %definition.name, "Duplicate tool name skipped");
                return;
            }
            handlers.insert(definition.name.clone(), handler);
            definitions.push(definition);
        };

        for name in enabled_tool_names {
            if name == CALL_CONTROL_TOOLSET {
                for definition in CallControlTools::tool_definitions() {
                    add(definition, RegisteredTool::CallControl);
                }
            } else if let Some(tool) = catalog.get(name) {
                add(tool.definition(), RegisteredTool::External(tool));
            } else {
                warn!(tool = %name, "Enabled tool is not available, skipping");
            }
        }

        let mut ids = enabled_tool_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            match integrations.get(&id) {
                Some(tool) => add(tool.definition(), RegisteredTool::External(tool.clone())),
                None => warn!(tool_id = id, "Integration tool not found, skipping"),
            }
        }

        Self {
            definitions: definitions.into(),
            handlers: Arc::new(handlers),
        }
    }

    pub fn for_agent(
        config: &AgentConfig,
        catalog: &ToolCatalog,
        integrations: &HashMap<i64, Arc<dyn ExternalTool>>,
    ) -> Self {
        Self::build(
            &config.enabled_tools,
            &config.enabled_tool_ids,
            catalog,
            integrations,
        )
    }

    pub fn all_tool_definitions(&self) -> Arc<[ToolDefinition]> {
        self.definitions.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Runs the named tool. Unknown names and tool errors become failures.
    pub async fn execute_tool(&self, name: &str, arguments: &Map<String, Value>) -> ToolOutcome {
        match self.handlers.get(name) {
            Some(RegisteredTool::CallControl) => CallControlTools::execute_tool(name, arguments),
            Some(RegisteredTool::External(tool)) => match tool.execute(arguments).await {
                Ok(data) => {
                    info!(tool = name, "External tool completed");
                    ToolOutcome::Data(data)
                }
                Err(e) => {
                    warn!(tool = name, error = %e, "External tool failed");
                    ToolOutcome::Failure(e.to_string())
                }
            },
            None => {
                warn!(tool = name, "Model called a tool that is not registered");
                ToolOutcome::unknown()
            }
        }
    }
}
