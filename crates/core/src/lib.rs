//! Core of the realtime voice session bridge: agent snapshots, tools, the
//! resilience layer and the session lifecycle. Transport-specific code lives
//! in the API service.

pub mod agent;
pub mod error;
pub mod realtime;
pub mod resilience;
pub mod scripted;
pub mod session;
pub mod store;
pub mod tools;
