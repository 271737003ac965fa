//! In-process realtime connector driven by the caller.
//!
//! `ScriptedConnector` hands out a fresh `ScriptedUpstream` per connection.
//! Tests push server events into it and inspect what the bridge sent back.
//! Nothing here touches the network.

use crate::{
    error::{ResilienceError, UpstreamError},
    realtime::{
        RealtimeConnector, RealtimeGrant, RealtimeSession, UPSTREAM_SERVICE, UpstreamEvent,
        UpstreamSessionConfig,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicUsize, Ordering},
};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One fake upstream connection.
pub struct ScriptedUpstream {
    events_tx: mpsc::UnboundedSender<Result<UpstreamEvent, UpstreamError>>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<Result<UpstreamEvent, UpstreamError>>>,
    sent: Mutex<Vec<Value>>,
    audio: Mutex<Vec<Bytes>>,
    closes: AtomicUsize,
    closed: CancellationToken,
    config: UpstreamSessionConfig,
}

impl ScriptedUpstream {
    fn new(config: UpstreamSessionConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx: AsyncMutex::new(events_rx),
            sent: Mutex::new(Vec::new()),
            audio: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            closed: CancellationToken::new(),
            config,
        }
    }

    /// Queues a server event; `event` must carry a `type` field.
    pub fn push_event(&self, event: Value) {
        let event_type = event
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let _ = self.events_tx.send(Ok(UpstreamEvent {
            event_type,
            payload: event,
        }));
    }

    pub fn push_error(&self, error: UpstreamError) {
        let _ = self.events_tx.send(Err(error));
    }

    /// Simulates the server dropping the connection.
    pub fn hang_up(&self) {
        self.closed.cancel();
    }

    pub fn sent_events(&self) -> Vec<Value> {
        lock(&self.sent).clone()
    }

    pub fn sent_audio(&self) -> Vec<Bytes> {
        lock(&self.audio).clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &UpstreamSessionConfig {
        &self.config
    }

    /// Waits until the connection is closed by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

struct ScriptedSession(Arc<ScriptedUpstream>);

#[async_trait]
impl RealtimeSession for ScriptedSession {
    async fn send_audio(&self, audio: Bytes) -> Result<(), UpstreamError> {
        if self.0.closed.is_cancelled() {
            return Err(UpstreamError::Closed);
        }
        lock(&self.0.audio).push(audio);
        Ok(())
    }

    async fn send_event(&self, event: Value) -> Result<(), UpstreamError> {
        if self.0.closed.is_cancelled() {
            return Err(UpstreamError::Closed);
        }
        lock(&self.0.sent).push(event);
        Ok(())
    }

    async fn next_event(&self) -> Option<Result<UpstreamEvent, UpstreamError>> {
        let mut rx = self.0.events_rx.lock().await;
        tokio::select! {
            biased;
            event = rx.recv() => event,
            _ = self.0.closed.cancelled() => None,
        }
    }

    async fn close(&self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        self.0.closed.cancel();
    }
}

/// Connector whose handshakes and connections stay in process.
#[derive(Default)]
pub struct ScriptedConnector {
    handshake_failure: Mutex<Option<u16>>,
    handshakes: AtomicUsize,
    credentials: Mutex<Vec<String>>,
    upstreams: Mutex<Vec<Arc<ScriptedUpstream>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following handshake fail with `status`.
    pub fn fail_handshakes_with(&self, status: u16) {
        *lock(&self.handshake_failure) = Some(status);
    }

    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    /// Credentials presented to the handshake, in order.
    pub fn credentials(&self) -> Vec<String> {
        lock(&self.credentials).clone()
    }

    pub fn last_upstream(&self) -> Option<Arc<ScriptedUpstream>> {
        lock(&self.upstreams).last().cloned()
    }

    fn handshake(&self, credential: &str) -> Result<(), ResilienceError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        lock(&self.credentials).push(credential.to_string());
        match *lock(&self.handshake_failure) {
            Some(status) if status >= 500 => Err(ResilienceError::ServerError {
                service: UPSTREAM_SERVICE.to_string(),
                status,
                body: "scripted failure".to_string(),
            }),
            Some(status) => Err(ResilienceError::ClientError {
                service: UPSTREAM_SERVICE.to_string(),
                status,
                body: "scripted failure".to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RealtimeConnector for ScriptedConnector {
    async fn create_session(
        &self,
        credential: &str,
        _config: &UpstreamSessionConfig,
    ) -> Result<RealtimeGrant, ResilienceError> {
        self.handshake(credential)?;
        let n = self.handshake_count();
        Ok(RealtimeGrant {
            client_secret: format!("ek_scripted_{n}"),
            expires_at: None,
            raw: json!({ "value": format!("ek_scripted_{n}") }),
        })
    }

    async fn connect(
        &self,
        _grant: &RealtimeGrant,
        config: &UpstreamSessionConfig,
    ) -> Result<Box<dyn RealtimeSession>, UpstreamError> {
        let upstream = Arc::new(ScriptedUpstream::new(config.clone()));
        lock(&self.upstreams).push(upstream.clone());
        Ok(Box::new(ScriptedSession(upstream)))
    }

    async fn negotiate_sdp(
        &self,
        credential: &str,
        offer: Bytes,
        _config: &UpstreamSessionConfig,
    ) -> Result<String, ResilienceError> {
        self.handshake(credential)?;
        Ok(format!("answer-for:{}", String::from_utf8_lossy(&offer)))
    }
}
