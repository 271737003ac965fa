use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;
use voicebridge_core::{
    realtime::{DEFAULT_REALTIME_MODEL, DEFAULT_VOICE_SPEED, RealtimeSettings},
    resilience::{BreakerSettings, RetryPolicy},
};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_REALTIME_WS_URL: &str = "wss://api.openai.com/v1/realtime";

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    /// Platform credential, used when a workspace has none of its own.
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub realtime_ws_url: String,
    pub realtime_model: String,
    pub voice_speed: f32,
    pub http_timeout: Duration,
    pub http_max_retries: u32,
    pub http_backoff_factor: f64,
    pub breaker_failure_threshold: u32,
    pub breaker_open_timeout: Duration,
    pub log_level: Level,
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        let openai_base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string());
        let realtime_ws_url = std::env::var("OPENAI_REALTIME_WS_URL")
            .unwrap_or_else(|_| DEFAULT_REALTIME_WS_URL.to_string());
        let realtime_model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| DEFAULT_REALTIME_MODEL.to_string());

        let voice_speed: f32 = parse_var("REALTIME_VOICE_SPEED", DEFAULT_VOICE_SPEED)?;
        if !(0.25..=4.0).contains(&voice_speed) {
            return Err(ConfigError::InvalidValue(
                "REALTIME_VOICE_SPEED".to_string(),
                format!("{voice_speed} is outside 0.25..=4.0"),
            ));
        }

        let retry = RetryPolicy::default();
        let http_timeout = Duration::from_secs(parse_var(
            "HTTP_TIMEOUT_SECS",
            retry.timeout.as_secs(),
        )?);
        let http_max_retries = parse_var("HTTP_MAX_RETRIES", retry.max_retries)?;
        if http_max_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "HTTP_MAX_RETRIES".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let http_backoff_factor = parse_var("HTTP_BACKOFF_FACTOR", retry.backoff_factor)?;

        let breaker = BreakerSettings::default();
        let breaker_failure_threshold =
            parse_var("BREAKER_FAILURE_THRESHOLD", breaker.failure_threshold)?;
        let breaker_open_timeout = Duration::from_secs(parse_var(
            "BREAKER_OPEN_TIMEOUT_SECS",
            breaker.open_timeout.as_secs(),
        )?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            database_url,
            openai_api_key,
            openai_base_url,
            realtime_ws_url,
            realtime_model,
            voice_speed,
            http_timeout,
            http_max_retries,
            http_backoff_factor,
            breaker_failure_threshold,
            breaker_open_timeout,
            log_level,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.http_max_retries,
            backoff_factor: self.http_backoff_factor,
            timeout: self.http_timeout,
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.breaker_failure_threshold,
            open_timeout: self.breaker_open_timeout,
        }
    }

    pub fn realtime_settings(&self) -> RealtimeSettings {
        RealtimeSettings {
            model: self.realtime_model.clone(),
            voice_speed: self.voice_speed,
        }
    }
}
