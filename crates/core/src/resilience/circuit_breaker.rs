//! Per-service circuit breaker and the registry that owns one per service.
//!
//! The breaker is a three-state gate. `Closed` lets calls through and counts
//! consecutive failures; reaching the threshold opens it. `Open` rejects calls
//! without invoking them until `open_timeout` has elapsed since the last
//! failure, after which a single probe is admitted in `HalfOpen`. The probe's
//! outcome either closes the circuit or reopens it.

use crate::error::CircuitOpenError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds applied to every breaker created by a registry.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Read-only view of a breaker, for operators and health endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

/// Releases the half-open probe slot if the probing future is dropped before
/// it reports an outcome.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Executes `operation` if the circuit admits it.
    ///
    /// Rejections never invoke `operation` and surface as `E::from(CircuitOpenError)`.
    /// Every `Err` returned by the operation counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError> + Display,
    {
        self.call_with(operation, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors for which `is_failure`
    /// returns `true` count against the circuit.
    ///
    /// Other errors leave the state and failure count untouched. A half-open
    /// trial call that ends that way frees its slot so the next caller can
    /// try again.
    pub async fn call_with<F, Fut, T, E, P>(&self, operation: F, is_failure: P) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError> + Display,
        P: FnOnce(&E) -> bool,
    {
        let is_probe = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: is_probe,
        };

        let result = operation().await;

        match &result {
            Ok(_) => {
                guard.armed = false;
                self.record_success();
            }
            Err(e) => {
                if is_failure(e) {
                    guard.armed = false;
                    self.record_failure(&e.to_string());
                } else {
                    debug!(breaker = %self.name, error = %e, "Error not counted against circuit");
                }
            }
        }
        result
    }

    /// Decides whether a call may proceed. Returns `true` when the caller is
    /// the half-open probe.
    fn admit(&self) -> Result<bool, CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.settings.open_timeout);
                if recovered {
                    info!(breaker = %self.name, "Circuit breaker entering HALF_OPEN state");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error())
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!(breaker = %self.name, "Circuit breaker recovered - entering CLOSED state");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self, reason: &str) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.probe_in_flight = false;

        warn!(
            breaker = %self.name,
            failure_count = inner.failure_count,
            failure_threshold = self.settings.failure_threshold,
            reason,
            "Circuit breaker recorded failure"
        );

        let probe_failed = inner.state == CircuitState::HalfOpen;
        if probe_failed || inner.failure_count >= self.settings.failure_threshold {
            if inner.state != CircuitState::Open {
                error!(
                    breaker = %self.name,
                    failure_count = inner.failure_count,
                    "Circuit breaker OPENED"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    fn open_error(&self) -> CircuitOpenError {
        CircuitOpenError {
            service: self.name.clone(),
        }
    }

    /// Forces the breaker back to `Closed`, for operator recovery.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    pub fn state(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.settings.failure_threshold,
            open_timeout_secs: self.settings.open_timeout.as_secs(),
            last_failure_at: inner.last_failure_at,
        }
    }
}

/// Owns the single breaker instance for each external service name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `service`, creating it on first use.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.settings)))
            .clone()
    }

    pub fn find(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    /// Resets a known breaker. Returns `false` if no breaker has that name.
    pub fn reset(&self, service: &str) -> bool {
        match self.find(service) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshots of every breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.state()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
