//! Resilience layer for calls to external services.
//!
//! `CircuitBreaker` and `ResilientClient` are independent; callers compose
//! them by running a `request_with_retry` inside `CircuitBreaker::call`.

pub mod circuit_breaker;
pub mod client;

pub use circuit_breaker::{
    BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState,
};
pub use client::{
    FilePart, OutboundRequest, RequestBody, ResilientClient, RetryPolicy, Sleeper, TokioSleeper,
};
