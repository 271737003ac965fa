//! OpenAI Realtime API connector.
//!
//! The HTTP handshakes (ephemeral session, WebRTC SDP exchange) go through
//! `ResilientClient`; the audio connection is a `tokio-tungstenite` websocket.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::{Value, json};
use tokio::{net::TcpStream, sync::Mutex, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voicebridge_core::{
    error::{ResilienceError, UpstreamError},
    realtime::{
        RealtimeConnector, RealtimeGrant, RealtimeSession, UPSTREAM_SERVICE, UpstreamEvent,
        UpstreamSessionConfig, session_update,
    },
    resilience::{FilePart, OutboundRequest, ResilientClient, RetryPolicy},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const SESSIONS_ENDPOINT: &str = "/v1/realtime/sessions";
pub const CALLS_ENDPOINT: &str = "/v1/realtime/calls";

pub struct OpenAiRealtime {
    http: ResilientClient,
    ws_url: String,
    policy: RetryPolicy,
}

impl OpenAiRealtime {
    pub fn new(
        base_url: &str,
        ws_url: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, ResilienceError> {
        Ok(Self {
            http: ResilientClient::new(UPSTREAM_SERVICE, base_url)?,
            ws_url: ws_url.into(),
            policy,
        })
    }

    fn transport(message: impl Into<String>) -> ResilienceError {
        ResilienceError::Transport {
            service: UPSTREAM_SERVICE.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl RealtimeConnector for OpenAiRealtime {
    async fn create_session(
        &self,
        credential: &str,
        config: &UpstreamSessionConfig,
    ) -> Result<RealtimeGrant, ResilienceError> {
        let body = serde_json::to_value(config).map_err(|e| ResilienceError::InvalidRequest {
            service: UPSTREAM_SERVICE.to_string(),
            message: e.to_string(),
        })?;
        let request = OutboundRequest::post_json(SESSIONS_ENDPOINT, body).with_bearer(credential);
        let response = self.http.request_with_retry(&request, &self.policy).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Self::transport(e.to_string()))?;

        let grant = RealtimeGrant::from_response(&body)
            .ok_or_else(|| Self::transport("session response carried no client_secret"))?;
        info!(model = %config.model, "Ephemeral realtime session created");
        Ok(grant)
    }

    async fn connect(
        &self,
        grant: &RealtimeGrant,
        config: &UpstreamSessionConfig,
    ) -> Result<Box<dyn RealtimeSession>, UpstreamError> {
        let url = format!("{}?model={}", self.ws_url, config.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", grant.client_secret))
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        // The upgrade and the initial session.update share one deadline.
        let deadline = self.policy.timeout;
        let handshake = async {
            let (ws_stream, _) = connect_async(request)
                .await
                .map_err(|e| UpstreamError::Connect(e.to_string()))?;
            let (sink, stream) = ws_stream.split();
            info!("Connected to OpenAI Realtime API.");

            let session = OpenAiSession {
                sink: Mutex::new(sink),
                stream: Mutex::new(stream),
                closed: CancellationToken::new(),
            };
            session.send_event(session_update(config)).await?;
            Ok::<_, UpstreamError>(session)
        };
        let session = timeout(deadline, handshake).await.map_err(|_| {
            warn!(timeout_ms = deadline.as_millis() as u64, "Realtime handshake timed out");
            UpstreamError::Connect(format!(
                "handshake timed out after {}ms",
                deadline.as_millis()
            ))
        })??;
        Ok(Box::new(session))
    }

    async fn negotiate_sdp(
        &self,
        credential: &str,
        offer: Bytes,
        config: &UpstreamSessionConfig,
    ) -> Result<String, ResilienceError> {
        let mut session = serde_json::to_value(config).map_err(|e| {
            ResilienceError::InvalidRequest {
                service: UPSTREAM_SERVICE.to_string(),
                message: e.to_string(),
            }
        })?;
        if let Some(obj) = session.as_object_mut() {
            obj.insert("type".to_string(), json!("realtime"));
        }

        let parts = vec![
            FilePart {
                name: "sdp".to_string(),
                file_name: "offer.sdp".to_string(),
                content_type: "application/sdp".to_string(),
                data: offer,
            },
            FilePart {
                name: "session".to_string(),
                file_name: "session.json".to_string(),
                content_type: "application/json".to_string(),
                data: Bytes::from(session.to_string()),
            },
        ];
        let request = OutboundRequest::post_multipart(CALLS_ENDPOINT, parts).with_bearer(credential);
        let response = self.http.request_with_retry(&request, &self.policy).await?;
        let answer = response
            .text()
            .await
            .map_err(|e| Self::transport(e.to_string()))?;
        info!("WebRTC session created");
        Ok(answer)
    }
}

struct OpenAiSession {
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: CancellationToken,
}

/// `input_audio_buffer.append` carrying base64-encoded caller audio.
pub fn audio_append(audio: &[u8]) -> Value {
    json!({ "type": "input_audio_buffer.append", "audio": STANDARD.encode(audio) })
}

#[async_trait]
impl RealtimeSession for OpenAiSession {
    async fn send_audio(&self, audio: Bytes) -> Result<(), UpstreamError> {
        self.send_event(audio_append(&audio)).await
    }

    async fn send_event(&self, event: Value) -> Result<(), UpstreamError> {
        if self.closed.is_cancelled() {
            return Err(UpstreamError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(event.to_string().into()))
            .await
            .map_err(|e| UpstreamError::Protocol(e.to_string()))
    }

    async fn next_event(&self) -> Option<Result<UpstreamEvent, UpstreamError>> {
        let mut stream = self.stream.lock().await;
        loop {
            let message = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return None,
                message = stream.next() => message,
            };
            match message? {
                Ok(WsMessage::Text(text)) => return Some(UpstreamEvent::parse(&text)),
                Ok(WsMessage::Close(frame)) => {
                    info!(?frame, "OpenAI closed the realtime connection");
                    return None;
                }
                Ok(other) => debug!(kind = ?other, "Ignoring non-text upstream frame"),
                Err(e) => return Some(Err(UpstreamError::Protocol(e.to_string()))),
            }
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Err(e) = self.sink.lock().await.close().await {
            warn!(error = %e, "Error closing upstream websocket");
        }
    }
}
