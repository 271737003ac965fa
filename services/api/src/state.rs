//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the session manager,
//! the circuit breaker registry and the loaded configuration.

use crate::config::Config;
use std::sync::Arc;
use voicebridge_core::{resilience::CircuitBreakerRegistry, session::SessionManager};

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    /// The same registry the session manager and webhook tools use.
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(sessions: SessionManager, config: Config) -> Self {
        let breakers = sessions.breakers().clone();
        Self {
            sessions: Arc::new(sessions),
            breakers,
            config: Arc::new(config),
        }
    }
}
