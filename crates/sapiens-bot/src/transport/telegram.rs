// Telegram Bot API transport: long-polls `getUpdates` and forwards events to
// the app over an mpsc channel, and implements the outbound calls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    ChatId, ChatTransport, InboundEvent, InboundUser, MessageId, OutgoingMessage, TextFormat,
    TransportError,
};

const API_ROOT: &str = "https://api.telegram.org";
/// Covers the long-poll window plus slack.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(40);
const LONG_POLL_SECS: u64 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
struct TgMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl TgUser {
    fn into_inbound(self) -> InboundUser {
        let display_name = match self.last_name.as_deref().filter(|s| !s.is_empty()) {
            Some(last) if !self.first_name.is_empty() => format!("{} {last}", self.first_name),
            Some(last) => last.to_string(),
            None => self.first_name,
        };
        InboundUser {
            id: self.id,
            handle: self.username.filter(|u| !u.is_empty()),
            display_name,
        }
    }
}

impl Update {
    /// The event this update carries, if it is one the bot handles.
    /// Messages from other bots and non-text messages are dropped.
    pub fn into_event(self) -> Option<InboundEvent> {
        if let Some(message) = self.message {
            let from = message.from?;
            if from.is_bot {
                return None;
            }
            let text = message.text?;
            return Some(InboundEvent::Text {
                user: from.into_inbound(),
                chat_id: message.chat.id,
                text,
            });
        }

        if let Some(query) = self.callback_query {
            let data = query.data?;
            let user = query.from.into_inbound();
            let (chat_id, message_id) = match query.message {
                Some(m) => (m.chat.id, Some(m.message_id)),
                None => (user.id, None),
            };
            return Some(InboundEvent::Button {
                user,
                chat_id,
                message_id,
                callback_id: query.id,
                data,
            });
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TelegramTransport {
    http: Client,
    base: String,
}

impl TelegramTransport {
    pub fn new(token: &str) -> anyhow::Result<Self> {
        Self::with_api_root(API_ROOT, token)
    }

    /// Point the client at a different Bot API server.
    pub fn with_api_root(api_root: &str, token: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build Telegram HTTP client")?;
        Ok(Self {
            http,
            base: format!("{}/bot{}", api_root.trim_end_matches('/'), token),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, TransportError> {
        let response = self
            .http
            .post(format!("{}/{}", self.base, method))
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let parsed: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        unwrap_response(parsed, status)
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TransportError> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": LONG_POLL_SECS,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }
}

fn unwrap_response<T>(parsed: ApiResponse<T>, status: u16) -> Result<T, TransportError> {
    match parsed {
        ApiResponse {
            ok: true,
            result: Some(result),
            ..
        } => Ok(result),
        ApiResponse {
            ok: true,
            result: None,
            ..
        } => Err(TransportError::Decode("response without result".into())),
        ApiResponse {
            description,
            error_code,
            ..
        } => Err(TransportError::Api {
            code: error_code.unwrap_or(status),
            description: description.unwrap_or_else(|| "Unknown error".into()),
        }),
    }
}

/// Request body fields shared by `sendMessage` and `editMessageText`.
fn message_body(chat_id: ChatId, message: &OutgoingMessage) -> Value {
    let mut body = json!({
        "chat_id": chat_id,
        "text": message.text,
        "disable_web_page_preview": true,
    });
    if message.format == TextFormat::MarkdownV2 {
        body["parse_mode"] = json!("MarkdownV2");
    }
    if !message.buttons.is_empty() {
        let row: Vec<Value> = message
            .buttons
            .iter()
            .map(|b| json!({ "text": b.label, "callback_data": b.data }))
            .collect();
        body["reply_markup"] = json!({ "inline_keyboard": [row] });
    }
    body
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: ChatId,
        message: &OutgoingMessage,
    ) -> Result<MessageId, TransportError> {
        let sent: SentMessage = self
            .call("sendMessage", &message_body(chat_id, message))
            .await?;
        Ok(sent.message_id)
    }

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        message: &OutgoingMessage,
    ) -> Result<(), TransportError> {
        let mut body = message_body(chat_id, message);
        body["message_id"] = json!(message_id);
        // Result is the edited Message, or `true` for inline messages.
        let _: Value = self.call("editMessageText", &body).await?;
        Ok(())
    }

    async fn answer_button(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        let _: bool = self.call("answerCallbackQuery", &body).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Long-poll loop
// ---------------------------------------------------------------------------

/// Long-poll for updates and forward them through `tx` until `shutdown`
/// flips to true or the receiver is dropped.
pub async fn run_polling(
    transport: Arc<TelegramTransport>,
    tx: mpsc::Sender<InboundEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("Telegram long-polling started");
    let mut offset: i64 = 0;

    loop {
        let updates = tokio::select! {
            result = transport.get_updates(offset) => result,
            _ = shutdown.changed() => break,
        };

        match updates {
            Ok(updates) => {
                if process_updates(updates, &tx, &mut offset).await.is_err() {
                    info!("Inbound channel closed, stopping long-poll");
                    break;
                }
            }
            Err(e) => {
                warn!("getUpdates failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }
    }

    info!("Telegram long-polling stopped");
    Ok(())
}

/// Forward each update's event through `tx` and advance `offset` past it.
/// Returns `Err(())` if the channel is closed.
pub async fn process_updates(
    updates: Vec<Update>,
    tx: &mpsc::Sender<InboundEvent>,
    offset: &mut i64,
) -> Result<(), ()> {
    for update in updates {
        *offset = (*offset).max(update.update_id + 1);
        let update_id = update.update_id;
        match update.into_event() {
            Some(event) => {
                if tx.send(event).await.is_err() {
                    return Err(());
                }
            }
            None => debug!(update_id, "ignoring update"),
        }
    }
    Ok(())
}
