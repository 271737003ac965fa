//! WebSocket Session Management
//!
//! - `protocol`: the JSON envelopes exchanged with the client.
//! - `session`: the connection lifecycle, from upgrade to teardown.
//! - `bridge`: the two forwarding tasks and tool-call dispatch.
//! - `provider`: connectors to third-party realtime voice APIs.

pub mod bridge;
pub mod protocol;
pub mod provider;
pub mod session;

pub use provider::OpenAiRealtime;
pub use session::ws_handler;
