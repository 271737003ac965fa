//! Voice Agent Configuration
//!
//! `AgentRecord` is the row owned by the agent CRUD collaborator.
//! `AgentConfig` is the immutable snapshot a session captures at start; edits
//! to the record after that point never reach a live session.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const DEFAULT_VOICE: &str = "shimmer";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant.";

/// Tool name that enables the built-in call-control tools for an agent.
pub const CALL_CONTROL_TOOLSET: &str = "call_control";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingTier {
    Budget,
    Balanced,
    Premium,
}

impl PricingTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingTier::Budget => "budget",
            PricingTier::Balanced => "balanced",
            PricingTier::Premium => "premium",
        }
    }

    /// Only premium agents may use the realtime speech-to-speech model.
    pub fn supports_realtime(&self) -> bool {
        matches!(self, PricingTier::Premium)
    }
}

impl fmt::Display for PricingTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PricingTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "budget" => Ok(PricingTier::Budget),
            "balanced" => Ok(PricingTier::Balanced),
            "premium" => Ok(PricingTier::Premium),
            other => Err(format!("unknown pricing tier '{other}'")),
        }
    }
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 200,
            silence_duration_ms: 200,
        }
    }
}

/// An agent as stored by the configuration collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub is_active: bool,
    pub pricing_tier: String,
    pub system_prompt: Option<String>,
    pub language: Option<String>,
    pub voice: Option<String>,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(default)]
    pub enabled_tool_ids: Vec<i64>,
    #[serde(default)]
    pub turn_detection: Option<TurnDetection>,
}

/// Immutable per-session view of an agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentConfig {
    pub agent_id: String,
    pub workspace_id: String,
    pub name: String,
    pub is_active: bool,
    pub pricing_tier: String,
    pub system_prompt: String,
    pub language: Option<String>,
    pub instructions: String,
    pub voice: String,
    pub enabled_tools: Vec<String>,
    pub enabled_tool_ids: Vec<i64>,
    pub turn_detection: TurnDetection,
}

impl AgentConfig {
    /// Captures a snapshot of `record`, filling in platform defaults.
    pub fn snapshot(record: &AgentRecord) -> Self {
        let system_prompt = record
            .system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
            .to_string();
        let instructions =
            build_instructions_with_language(&system_prompt, record.language.as_deref());
        Self {
            agent_id: record.id.clone(),
            workspace_id: record.workspace_id.clone(),
            name: record.name.clone(),
            is_active: record.is_active,
            pricing_tier: record.pricing_tier.clone(),
            system_prompt,
            language: record.language.clone(),
            instructions,
            voice: record
                .voice
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            enabled_tools: record.enabled_tools.clone(),
            enabled_tool_ids: record.enabled_tool_ids.clone(),
            turn_detection: record.turn_detection.clone().unwrap_or_default(),
        }
    }

    pub fn tier(&self) -> Option<PricingTier> {
        self.pricing_tier.parse().ok()
    }

    pub fn allows_call_control(&self) -> bool {
        self.enabled_tools.iter().any(|t| t == CALL_CONTROL_TOOLSET)
    }
}

fn language_name(code: &str) -> &str {
    match code {
        "es" => "Spanish",
        "fr" => "French",
        "de" => "German",
        "it" => "Italian",
        "pt" => "Portuguese",
        "nl" => "Dutch",
        "pl" => "Polish",
        "ja" => "Japanese",
        "ko" => "Korean",
        "zh" => "Chinese",
        "hi" => "Hindi",
        "ar" => "Arabic",
        other => other,
    }
}

/// Appends a response-language directive for non-English agents.
pub fn build_instructions_with_language(system_prompt: &str, language: Option<&str>) -> String {
    let code = match language.map(str::trim).filter(|l| !l.is_empty()) {
        Some(code) => code.to_lowercase(),
        None => return system_prompt.to_string(),
    };
    let base = code.split(['-', '_']).next().unwrap_or(&code).to_string();
    if base == "en" {
        return system_prompt.to_string();
    }
    format!(
        "{system_prompt}\n\nIMPORTANT: Always respond in {}, even if the caller uses another language.",
        language_name(&base)
    )
}
