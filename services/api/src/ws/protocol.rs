//! Defines the WebSocket message protocol between the caller's client and the API server.

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use voicebridge_core::{agent::AgentConfig, tools::CallAction};

/// A JSON control event from the client. Only the `type` is interpreted.
#[derive(Deserialize, Debug)]
pub struct ClientEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ReadyAgent {
    pub id: String,
    pub name: String,
    pub tier: String,
}

impl From<&AgentConfig> for ReadyAgent {
    fn from(agent: &AgentConfig) -> Self {
        Self {
            id: agent.agent_id.clone(),
            name: agent.name.clone(),
            tier: agent.pricing_tier.clone(),
        }
    }
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Reports a fatal error; the connection is closed right after.
    #[serde(rename = "error")]
    Error { error: String },
    /// The upstream session is open and audio may flow.
    #[serde(rename = "session.ready")]
    SessionReady { session_id: String, agent: ReadyAgent },
    /// A call-control action for the telephony side to carry out.
    #[serde(rename = "call.action")]
    CallAction { action: CallAction },
}

impl ServerMessage {
    pub fn to_message(&self) -> Message {
        let payload = serde_json::to_string(self).unwrap_or_default();
        Message::Text(payload.into())
    }
}

/// Sends a serialized message to the client sink.
pub async fn send_msg<S>(sink: &mut S, msg: &ServerMessage) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    sink.send(msg.to_message()).await
}
