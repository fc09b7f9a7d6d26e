// Webhook relay ("arena"): an HTTP server that receives peer messages and a
// client that registers this bot and posts its replies back.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use sapiens_llm::NarrativeGenerator;

const RELAY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Outbound client
// ---------------------------------------------------------------------------

pub struct RelayClient {
    http: Client,
    base_url: String,
    bot_name: String,
}

impl RelayClient {
    pub fn new(base_url: &str, bot_name: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(RELAY_TIMEOUT)
            .build()
            .context("failed to build relay HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            bot_name: bot_name.to_string(),
        })
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> bool {
        let url = format!("{}{path}", self.base_url);
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("Relay {path} returned HTTP {}", resp.status());
                false
            }
            Err(e) => {
                warn!("Relay {path} failed: {e}");
                false
            }
        }
    }

    /// Post a reply into the shared room.
    pub async fn say(&self, text: &str) -> bool {
        self.post("/say", json!({ "bot_name": self.bot_name, "text": text }))
            .await
    }

    /// Announce this bot and where the relay should deliver messages.
    pub async fn register(&self, webhook_url: &str) -> bool {
        let ok = self
            .post(
                "/register",
                json!({ "bot_name": self.bot_name, "webhook_url": webhook_url }),
            )
            .await;
        if ok {
            info!("Registered with relay as {}", self.bot_name);
        }
        ok
    }

    pub async fn check_health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("Relay health check failed: {e}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingRelayMessage {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RelayAck {
    fn status(status: &'static str) -> Self {
        Self {
            status,
            message: None,
        }
    }

    fn error(message: &str) -> Self {
        Self {
            status: "error",
            message: Some(message.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct RelayState {
    pub narrative: Arc<NarrativeGenerator>,
    pub client: Arc<RelayClient>,
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/message", post(message_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn message_handler(
    State(state): State<RelayState>,
    Json(payload): Json<IncomingRelayMessage>,
) -> Json<RelayAck> {
    Json(handle_relay_message(&state, payload).await)
}

async fn health_handler(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "bot_name": state.client.bot_name() }))
}

/// React to one relay message: ignore our own, reply to everyone else.
pub async fn handle_relay_message(state: &RelayState, payload: IncomingRelayMessage) -> RelayAck {
    let (Some(from), Some(text)) = (payload.from, payload.text) else {
        warn!("Relay payload missing from/text");
        return RelayAck::error("Incomplete payload");
    };
    if from.trim().is_empty() || text.trim().is_empty() {
        return RelayAck::error("Incomplete payload");
    }

    if from == state.client.bot_name() {
        return RelayAck::status("ignored");
    }

    info!("Relay message from {from}");
    let reply = state.narrative.generate_relay_reply(&text).await;
    if state.client.say(&reply).await {
        RelayAck::status("ok")
    } else {
        RelayAck::error("Failed to deliver reply")
    }
}

/// Serve the relay webhook on `port` until `shutdown` flips to true.
pub async fn serve(
    port: u16,
    state: RelayState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind relay server on {addr}"))?;
    info!("Relay server listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("relay server failed")?;

    info!("Relay server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use sapiens_llm::{GenerationRequest, LlmError, NarrativeSettings, TextGenerator};

    use super::*;

    struct FixedGenerator;

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(&self, _request: &GenerationRequest) -> Result<String, LlmError> {
            Ok("Translation: hello".into())
        }
    }

    /// Relay pointed at a closed port so every outbound call fails fast.
    fn state() -> RelayState {
        RelayState {
            narrative: Arc::new(NarrativeGenerator::new(
                Arc::new(FixedGenerator),
                NarrativeSettings::default(),
            )),
            client: Arc::new(RelayClient::new("http://127.0.0.1:9/", "ChroniclerBot").unwrap()),
        }
    }

    fn message(from: Option<&str>, text: Option<&str>) -> IncomingRelayMessage {
        IncomingRelayMessage {
            from: from.map(str::to_string),
            text: text.map(str::to_string),
            ts: None,
        }
    }

    #[tokio::test]
    async fn incomplete_payload_is_rejected() {
        let state = state();
        for payload in [
            message(None, Some("hi")),
            message(Some("Other"), None),
            message(Some(" "), Some("hi")),
        ] {
            let ack = handle_relay_message(&state, payload).await;
            assert_eq!(ack, RelayAck::error("Incomplete payload"));
        }
    }

    #[tokio::test]
    async fn own_messages_are_ignored() {
        let ack = handle_relay_message(&state(), message(Some("ChroniclerBot"), Some("hi"))).await;
        assert_eq!(ack, RelayAck::status("ignored"));
    }

    #[tokio::test]
    async fn undeliverable_reply_reports_error() {
        let ack = handle_relay_message(&state(), message(Some("Other"), Some("hola"))).await;
        assert_eq!(ack.status, "error");
    }

    #[tokio::test]
    async fn unreachable_relay_is_soft_failure() {
        let client = RelayClient::new("http://127.0.0.1:9", "ChroniclerBot").unwrap();
        assert!(!client.check_health().await);
        assert!(!client.register("http://me:8081/message").await);
        assert!(!client.say("hello").await);
    }

    #[test]
    fn payload_tolerates_missing_fields() {
        let payload: IncomingRelayMessage = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert!(payload.from.is_none());
        assert_eq!(payload.text.as_deref(), Some("hi"));
    }

    #[test]
    fn ack_omits_empty_message() {
        let value = serde_json::to_value(RelayAck::status("ok")).unwrap();
        assert_eq!(value, json!({ "status": "ok" }));
    }
}
