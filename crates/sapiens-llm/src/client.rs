// Chat-completions streaming client using reqwest-eventsource.
//
// Sends a single system + user message pair to an OpenAI-compatible
// `/chat/completions` endpoint with `stream: true` and accumulates the
// content deltas into one text blob.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest_eventsource::{Event, RequestBuilderExt};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use sapiens_core::config::Config;

/// Upper bound on one whole completion, connect to last chunk.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

// ---------------------------------------------------------------------------
// Request / error types
// ---------------------------------------------------------------------------

/// One generation call: a fixed system instruction plus the user prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    #[error("LLM not configured")]
    NotConfigured,

    #[error("network error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("API returned status {0}")]
    Status(u16),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("model returned no text")]
    EmptyResponse,
}

/// A backend that turns a prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError>;
}

// ---------------------------------------------------------------------------
// OpenAiClient
// ---------------------------------------------------------------------------

/// Low-level chat-completions streaming client.
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    /// `base_url` is the API root, e.g. `https://api.openai.com/v1`.
    pub fn new(base_url: &str, api_key: String, model: String) -> Result<Self, LlmError> {
        Self::with_timeout(base_url, api_key, model, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: String,
        model: String,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stream a completion and return the concatenated text.
    pub async fn stream_completion(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::NotConfigured);
        }

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt }
            ]
        });

        let builder = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body);

        let mut es = builder
            .eventsource()
            .map_err(|e| LlmError::Stream(format!("failed to create event source: {e}")))?;

        let mut full_text = String::new();

        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Open) => {
                    debug!("SSE connection opened");
                }
                Ok(Event::Message(msg)) => {
                    if msg.data.trim() == "[DONE]" {
                        debug!("[DONE] received, streaming complete");
                        es.close();
                        break;
                    }
                    match parse_delta_content(&msg.data) {
                        Some(text) => full_text.push_str(&text),
                        None => {
                            if let Some(reason) = parse_finish_reason(&msg.data) {
                                debug!(reason, "finish_reason");
                            }
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => {
                    debug!("stream ended without [DONE]");
                    es.close();
                    break;
                }
                Err(err) => {
                    warn!(?err, "SSE stream error");
                    es.close();
                    return Err(classify_stream_error(&err));
                }
            }
        }

        let text = full_text.trim();
        if text.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text.to_string())
    }
}

// ---------------------------------------------------------------------------
// LlmClient wrapper
// ---------------------------------------------------------------------------

/// Either a configured client or a disabled stub that fails every call.
pub enum LlmClient {
    Active(OpenAiClient),
    /// No API key configured.
    Disabled,
}

impl LlmClient {
    /// `Active` when an API key is present in credentials, otherwise
    /// `Disabled`. A client that cannot be built also yields `Disabled`.
    pub fn from_config(config: &Config) -> Self {
        let key = match &config.credentials.openai_api_key {
            Some(key) if !key.is_empty() => key,
            _ => return LlmClient::Disabled,
        };
        match OpenAiClient::new(&config.llm.base_url, key.clone(), config.llm.model.clone()) {
            Ok(client) => LlmClient::Active(client),
            Err(e) => {
                error!("LLM client unavailable: {e}");
                LlmClient::Disabled
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LlmClient::Active(_))
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        match self {
            LlmClient::Active(client) => client.stream_completion(request).await,
            LlmClient::Disabled => Err(LlmError::NotConfigured),
        }
    }
}

// ---------------------------------------------------------------------------
// SSE JSON parsing helpers
// ---------------------------------------------------------------------------

/// Extract `choices[0].delta.content` from a streamed chunk.
///
/// Expected shape: `{ "choices": [ { "delta": { "content": "..." } } ] }`
pub(crate) fn parse_delta_content(data: &str) -> Option<String> {
    let v: Value = serde_json::from_str(data).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

/// Extract `choices[0].finish_reason` when present and non-null.
pub(crate) fn parse_finish_reason(data: &str) -> Option<String> {
    let v: Value = serde_json::from_str(data).ok()?;
    v.get("choices")?
        .get(0)?
        .get("finish_reason")?
        .as_str()
        .map(|s| s.to_string())
}

fn classify_stream_error(err: &reqwest_eventsource::Error) -> LlmError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _response) => {
            LlmError::Status(status.as_u16())
        }
        reqwest_eventsource::Error::Transport(e) if e.is_timeout() => LlmError::Timeout,
        reqwest_eventsource::Error::Transport(e) => LlmError::Transport(e.to_string()),
        other => LlmError::Stream(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
