//! Call-control tools: end the call, transfer it, or send DTMF tones.
//!
//! The handlers never touch the telephony connection. They validate the
//! model's request and return a `CallAction` for the bridge to carry out.

use super::{ToolDefinition, ToolOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

pub const END_CALL: &str = "end_call";
pub const TRANSFER_CALL: &str = "transfer_call";
pub const SEND_DTMF: &str = "send_dtmf";

/// Names in the order they are exposed to the model.
pub const CALL_CONTROL_TOOL_NAMES: [&str; 3] = [END_CALL, TRANSFER_CALL, SEND_DTMF];

pub const DEFAULT_DTMF_DURATION_MS: u64 = 250;
const DEFAULT_END_REASON: &str = "conversation_complete";
/// Tone letters must be upper case; the pause marker may be either case.
const VALID_DTMF_CHARS: &str = "0123456789*#ABCDwW";

/// A telephony action requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CallAction {
    EndCall {
        reason: String,
    },
    TransferCall {
        destination: String,
        announce: Option<String>,
    },
    SendDtmf {
        digits: String,
        duration_ms: u64,
    },
}

impl CallAction {
    pub fn name(&self) -> &'static str {
        match self {
            CallAction::EndCall { .. } => END_CALL,
            CallAction::TransferCall { .. } => TRANSFER_CALL,
            CallAction::SendDtmf { .. } => SEND_DTMF,
        }
    }

    /// Whether carrying out the action hands the caller off from this session.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            CallAction::EndCall { .. } | CallAction::TransferCall { .. }
        )
    }

    pub fn message(&self) -> String {
        match self {
            CallAction::EndCall { .. } => "Call will be ended after this response.".to_string(),
            CallAction::TransferCall { destination, .. } => {
                format!("Transferring call to {destination}.")
            }
            CallAction::SendDtmf { digits, .. } => format!("Sending DTMF tones: {digits}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EndCallArgs {
    #[serde(default = "default_end_reason")]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransferCallArgs {
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub announce: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SendDtmfArgs {
    #[serde(default)]
    pub digits: String,
    #[serde(default = "default_dtmf_duration")]
    pub duration_ms: u64,
}

fn default_end_reason() -> String {
    DEFAULT_END_REASON.to_string()
}

fn default_dtmf_duration() -> u64 {
    DEFAULT_DTMF_DURATION_MS
}

/// Tool-call arguments decoded into the shape of the tool they target.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    EndCall(EndCallArgs),
    TransferCall(TransferCallArgs),
    SendDtmf(SendDtmfArgs),
    External {
        name: String,
        arguments: Map<String, Value>,
    },
}

impl ToolInvocation {
    /// Decodes raw model arguments. Only call-control tools are typed here;
    /// any other name becomes `External` and is validated by its tool.
    pub fn parse(name: &str, arguments: &Map<String, Value>) -> Result<Self, String> {
        fn decode<T: for<'de> Deserialize<'de>>(
            name: &str,
            arguments: &Map<String, Value>,
        ) -> Result<T, String> {
            serde_json::from_value(Value::Object(arguments.clone()))
                .map_err(|e| format!("Invalid arguments for {name}: {e}"))
        }

        match name {
            END_CALL => decode(name, arguments).map(ToolInvocation::EndCall),
            TRANSFER_CALL => decode(name, arguments).map(ToolInvocation::TransferCall),
            SEND_DTMF => decode(name, arguments).map(ToolInvocation::SendDtmf),
            other => Ok(ToolInvocation::External {
                name: other.to_string(),
                arguments: arguments.clone(),
            }),
        }
    }
}

pub struct CallControlTools;

impl CallControlTools {
    pub fn is_call_control(name: &str) -> bool {
        CALL_CONTROL_TOOL_NAMES.contains(&name)
    }

    /// Definitions for the three call-control tools, in fixed order.
    pub fn tool_definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::function(
                END_CALL,
                "End the current phone call. Use this when the conversation is complete, \
                 the caller wants to hang up, or you've said goodbye. Always say a brief \
                 farewell before calling this function.",
                json!({
                    "reason": {
                        "type": "string",
                        "description": "Brief reason for ending the call (e.g., 'conversation_complete', \
                                        'caller_requested', 'no_response', 'transferred')"
                    }
                }),
                &["reason"],
            ),
            ToolDefinition::function(
                TRANSFER_CALL,
                "Transfer the call to another phone number or department. Use this when \
                 the caller needs to speak with a human agent, a specialist, or another \
                 department. Inform the caller before transferring.",
                json!({
                    "destination": {
                        "type": "string",
                        "description": "Phone number to transfer to (E.164 format like +1234567890) \
                                        or a department identifier"
                    },
                    "announce": {
                        "type": "string",
                        "description": "Optional message to announce to the destination before connecting \
                                        (e.g., 'Incoming transfer from customer support')"
                    }
                }),
                &["destination"],
            ),
            ToolDefinition::function(
                SEND_DTMF,
                "Send DTMF touch-tones during the call. Use this for navigating automated \
                 phone systems (IVR), entering PINs, extension numbers, or confirmation codes.",
                json!({
                    "digits": {
                        "type": "string",
                        "description": "The DTMF digits to send. Valid characters: 0-9, *, #, A-D. \
                                        Use 'w' for a 0.5s pause between digits."
                    },
                    "duration_ms": {
                        "type": "integer",
                        "description": "Duration of each tone in milliseconds (default: 250)"
                    }
                }),
                &["digits"],
            ),
        ]
    }

    /// Dispatches a call-control tool by exact name.
    pub fn execute_tool(name: &str, arguments: &Map<String, Value>) -> ToolOutcome {
        match ToolInvocation::parse(name, arguments) {
            Ok(ToolInvocation::EndCall(args)) => Self::end_call(args),
            Ok(ToolInvocation::TransferCall(args)) => Self::transfer_call(args),
            Ok(ToolInvocation::SendDtmf(args)) => Self::send_dtmf(args),
            Ok(ToolInvocation::External { .. }) => ToolOutcome::unknown(),
            Err(error) => ToolOutcome::Failure(error),
        }
    }

    pub fn end_call(args: EndCallArgs) -> ToolOutcome {
        info!(reason = %args.reason, "end_call requested");
        ToolOutcome::Action(CallAction::EndCall {
            reason: args.reason,
        })
    }

    pub fn transfer_call(args: TransferCallArgs) -> ToolOutcome {
        let destination = args.destination.trim();
        if destination.is_empty() {
            return ToolOutcome::Failure("Destination is required for transfer".to_string());
        }
        let announce = args.announce.filter(|a| !a.trim().is_empty());
        info!(destination, announce = ?announce, "transfer_call requested");
        ToolOutcome::Action(CallAction::TransferCall {
            destination: destination.to_string(),
            announce,
        })
    }

    pub fn send_dtmf(args: SendDtmfArgs) -> ToolOutcome {
        if args.digits.is_empty() {
            return ToolOutcome::Failure("Digits are required for DTMF".to_string());
        }
        if !args.digits.chars().all(|c| VALID_DTMF_CHARS.contains(c)) {
            return ToolOutcome::Failure(
                "Invalid DTMF digits. Use 0-9, *, #, A-D, or 'w' for pause.".to_string(),
            );
        }
        let digits = normalize_dtmf(&args.digits);
        info!(digits = %digits, duration_ms = args.duration_ms, "send_dtmf requested");
        ToolOutcome::Action(CallAction::SendDtmf {
            digits,
            duration_ms: args.duration_ms,
        })
    }
}

/// Lower-cases the pause marker.
fn normalize_dtmf(digits: &str) -> String {
    digits.replace('W', "w")
}
