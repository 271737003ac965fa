//! Realtime Voice API Protocol
//!
//! Session configuration, upstream events and the two traits the session
//! layer talks through: `RealtimeConnector` performs the HTTP handshake and
//! opens connections, `RealtimeSession` is one open connection.

use crate::{
    agent::{AgentConfig, TurnDetection},
    error::{ResilienceError, UpstreamError},
    tools::{ToolCallEvent, ToolDefinition},
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Breaker name guarding every call to the realtime API.
pub const UPSTREAM_SERVICE: &str = "openai_realtime";

pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";
pub const DEFAULT_VOICE_SPEED: f32 = 1.15;
pub const TRANSCRIPTION_MODEL: &str = "whisper-1";

pub const FUNCTION_CALL_ARGUMENTS_DONE: &str = "response.function_call_arguments.done";
pub const RESPONSE_DONE: &str = "response.done";

/// Platform-wide knobs applied to every session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeSettings {
    pub model: String,
    pub voice_speed: f32,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_REALTIME_MODEL.to_string(),
            voice_speed: DEFAULT_VOICE_SPEED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// The session-configuration document sent during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamSessionConfig {
    pub model: String,
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub speed: f32,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: TurnDetection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl UpstreamSessionConfig {
    /// `tool_choice` is only set when at least one tool is enabled.
    pub fn build(agent: &AgentConfig, tools: &[ToolDefinition], settings: &RealtimeSettings) -> Self {
        Self {
            model: settings.model.clone(),
            modalities: vec!["audio".to_string(), "text".to_string()],
            instructions: agent.instructions.clone(),
            voice: agent.voice.clone(),
            speed: settings.voice_speed,
            input_audio_transcription: TranscriptionConfig {
                model: TRANSCRIPTION_MODEL.to_string(),
            },
            turn_detection: agent.turn_detection.clone(),
            tools: tools.to_vec(),
            tool_choice: (!tools.is_empty()).then(|| "auto".to_string()),
        }
    }
}

/// Ephemeral credential minted by the handshake for one upstream connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeGrant {
    pub client_secret: String,
    pub expires_at: Option<i64>,
    /// The `client_secret` object as returned upstream.
    pub raw: Value,
}

impl RealtimeGrant {
    /// Reads `client_secret.value` / `client_secret.expires_at` from a
    /// sessions-endpoint response body.
    pub fn from_response(body: &Value) -> Option<Self> {
        let secret = body.get("client_secret")?;
        let value = secret.get("value")?.as_str()?.to_string();
        Some(Self {
            client_secret: value,
            expires_at: secret.get("expires_at").and_then(Value::as_i64),
            raw: secret.clone(),
        })
    }
}

/// A server event from the realtime API, kept as raw JSON plus its type.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamEvent {
    pub event_type: String,
    pub payload: Value,
}

impl UpstreamEvent {
    pub fn parse(text: &str) -> Result<Self, UpstreamError> {
        let payload: Value =
            serde_json::from_str(text).map_err(|e| UpstreamError::Decode(e.to_string()))?;
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| UpstreamError::Decode("event without a type".to_string()))?
            .to_string();
        Ok(Self {
            event_type,
            payload,
        })
    }

    pub fn is_response_done(&self) -> bool {
        self.event_type == RESPONSE_DONE
    }

    /// Extracts the function call from a `response.function_call_arguments.done`
    /// event. `None` for every other event type.
    pub fn tool_call(&self) -> Option<Result<ToolCallEvent, String>> {
        if self.event_type != FUNCTION_CALL_ARGUMENTS_DONE {
            return None;
        }
        Some(parse_tool_call(&self.payload))
    }

    /// `{"type": <event type>, "event": <payload>}` as forwarded to the client.
    pub fn client_envelope(&self) -> Value {
        json!({ "type": self.event_type, "event": self.payload })
    }
}

fn parse_tool_call(payload: &Value) -> Result<ToolCallEvent, String> {
    let field = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("function call event missing '{key}'"))
    };
    let call_id = field("call_id")?;
    let name = field("name")?;

    let raw = payload.get("arguments").and_then(Value::as_str).unwrap_or("");
    let arguments = if raw.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err("function call arguments are not an object".to_string()),
            Err(e) => return Err(format!("function call arguments are not valid JSON: {e}")),
        }
    };

    Ok(ToolCallEvent {
        call_id,
        name,
        arguments,
    })
}

pub fn session_update(config: &UpstreamSessionConfig) -> Value {
    json!({ "type": "session.update", "session": config })
}

/// Returns a tool's result to the model as a conversation item.
pub fn function_call_output(call_id: &str, output: &Value) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output.to_string(),
        }
    })
}

pub fn response_create() -> Value {
    json!({ "type": "response.create" })
}

/// One open upstream realtime connection.
///
/// Implementations must tolerate `close` being called more than once and
/// calls racing with `next_event` from another task.
#[async_trait]
pub trait RealtimeSession: Send + Sync {
    /// Sends one chunk of raw caller audio.
    async fn send_audio(&self, audio: Bytes) -> Result<(), UpstreamError>;

    async fn send_event(&self, event: Value) -> Result<(), UpstreamError>;

    /// Next server event; `None` once the connection is closed.
    async fn next_event(&self) -> Option<Result<UpstreamEvent, UpstreamError>>;

    async fn close(&self);
}

/// Establishes upstream sessions. HTTP calls return `ResilienceError` so they
/// can run inside a circuit breaker.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Mints an ephemeral client secret for `config`.
    async fn create_session(
        &self,
        credential: &str,
        config: &UpstreamSessionConfig,
    ) -> Result<RealtimeGrant, ResilienceError>;

    /// Opens the realtime connection and applies `config` to it.
    async fn connect(
        &self,
        grant: &RealtimeGrant,
        config: &UpstreamSessionConfig,
    ) -> Result<Box<dyn RealtimeSession>, UpstreamError>;

    /// Exchanges a WebRTC SDP offer for the upstream SDP answer.
    async fn negotiate_sdp(
        &self,
        credential: &str,
        offer: Bytes,
        config: &UpstreamSessionConfig,
    ) -> Result<String, ResilienceError>;
}
