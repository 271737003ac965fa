//! Error taxonomy shared by the resilience layer, the session manager and
//! the persistence collaborator.

use thiserror::Error;

/// Returned by a circuit breaker that refuses to invoke its operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker {service} is OPEN - service unavailable")]
pub struct CircuitOpenError {
    pub service: String,
}

/// Classified failure of an outbound HTTP call.
#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Circuit breaker {service} is OPEN - service unavailable")]
    CircuitOpen { service: String },

    #[error("Rate limited by {service}, retry after {retry_after}s")]
    RateLimited { service: String, retry_after: u64 },

    #[error("Client error from {service}: {status}")]
    ClientError {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Server error from {service}: {status}")]
    ServerError {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Timeout calling {service}{endpoint}")]
    Timeout { service: String, endpoint: String },

    #[error("Transport error calling {service}: {message}")]
    Transport { service: String, message: String },

    #[error("Invalid request for {service}: {message}")]
    InvalidRequest { service: String, message: String },
}

impl From<CircuitOpenError> for ResilienceError {
    fn from(err: CircuitOpenError) -> Self {
        Self::CircuitOpen {
            service: err.service,
        }
    }
}

impl ResilienceError {
    /// The upstream HTTP status, when the failure carried one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::ClientError { status, .. } | Self::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the failure says something about the health of the remote
    /// service. Rejections of the caller's own request (bad credentials,
    /// malformed input) and local circuit rejections do not.
    pub fn is_service_failure(&self) -> bool {
        match self {
            Self::ClientError { .. } | Self::InvalidRequest { .. } | Self::CircuitOpen { .. } => {
                false
            }
            Self::RateLimited { .. }
            | Self::ServerError { .. }
            | Self::Timeout { .. }
            | Self::Transport { .. } => true,
        }
    }
}

/// Fatal, non-retryable problems with the agent or its credentials.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Agent {0} not found")]
    AgentNotFound(String),

    #[error("Agent is not active")]
    AgentInactive,

    #[error("Realtime voice is only available for premium tier agents (agent tier: {0})")]
    IneligibleTier(String),

    #[error("OpenAI API key not configured. Please add it in Settings.")]
    MissingCredential,
}

/// Failures of the persistence collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Malformed record: {0}")]
    Malformed(String),
}

/// Failures on an established upstream realtime connection.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Failed to connect to upstream: {0}")]
    Connect(String),

    #[error("Upstream connection closed")]
    Closed,

    #[error("Upstream protocol error: {0}")]
    Protocol(String),

    /// A single frame that could not be understood. The connection itself
    /// is still usable.
    #[error("Malformed upstream event: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Whether the connection can no longer carry the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Decode(_))
    }
}

/// Anything that can stop a session from opening.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Upstream handshake failed: {0}")]
    Handshake(#[from] ResilienceError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// HTTP status to report to a REST caller for this failure.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Configuration(ConfigurationError::AgentNotFound(_)) => 404,
            Self::Configuration(_) => 400,
            Self::Handshake(ResilienceError::CircuitOpen { .. }) => 503,
            Self::Handshake(err) => err.status().unwrap_or(502),
            Self::Upstream(_) => 502,
            Self::Store(_) => 500,
        }
    }
}
