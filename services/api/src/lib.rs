//! Voice Bridge API Library Crate
//!
//! Application state, configuration, the Postgres-backed agent store, REST
//! handlers, the realtime WebSocket bridge and routing. The `api` binary is a
//! thin wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
