// Chat transport contract: inbound events and the outbound calls the bot makes.

pub mod telegram;

use async_trait::async_trait;
use thiserror::Error;

use sapiens_core::model::UserId;

pub use telegram::TelegramTransport;

/// Chat (private or channel) that a message goes to.
pub type ChatId = i64;

pub type MessageId = i64;

/// Longest text a single message may carry on the chat platform.
pub const MAX_MESSAGE_CHARS: usize = 4096;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// The sender of an inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundUser {
    pub id: UserId,
    pub handle: Option<String>,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A text message (commands included).
    Text {
        user: InboundUser,
        chat_id: ChatId,
        text: String,
    },
    /// An inline button press.
    Button {
        user: InboundUser,
        chat_id: ChatId,
        /// Message carrying the button, when the platform still exposes it.
        message_id: Option<MessageId>,
        callback_id: String,
        data: String,
    },
}

impl InboundEvent {
    pub fn user(&self) -> &InboundUser {
        match self {
            InboundEvent::Text { user, .. } | InboundEvent::Button { user, .. } => user,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextFormat {
    #[default]
    Plain,
    MarkdownV2,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Text to send, with an optional single row of inline buttons.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutgoingMessage {
    pub text: String,
    pub format: TextFormat,
    pub buttons: Vec<Button>,
}

impl OutgoingMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// `text` must already be valid MarkdownV2.
    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: TextFormat::MarkdownV2,
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }

    /// Split into messages of at most `limit` characters, breaking between
    /// lines where possible. Buttons stay on the last part.
    pub fn split(&self, limit: usize) -> Vec<OutgoingMessage> {
        let parts = split_text(&self.text, limit);
        let last = parts.len().saturating_sub(1);
        parts
            .into_iter()
            .enumerate()
            .map(|(i, text)| OutgoingMessage {
                text,
                format: self.format,
                buttons: if i == last {
                    self.buttons.clone()
                } else {
                    Vec::new()
                },
            })
            .collect()
    }
}

fn split_text(text: &str, limit: usize) -> Vec<String> {
    // An escape pair must fit in one part.
    let limit = limit.max(2);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len <= limit {
            current.push_str(line);
            current_len += line_len;
            continue;
        }

        // Overlong line: cut between characters, never inside a `\x` escape.
        let mut chars = line.chars();
        while let Some(c) = chars.next() {
            let mut unit = String::from(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    unit.push(escaped);
                }
            }
            let unit_len = unit.chars().count();
            if current_len + unit_len > limit {
                parts.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current.push_str(&unit);
            current_len += unit_len;
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }

    parts.retain(|part| !part.trim().is_empty());
    if parts.is_empty() {
        parts.push(text.to_string());
    }
    parts
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("chat API error {code}: {description}")]
    Api { code: u16, description: String },

    #[error("failed to decode chat API response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat_id: ChatId,
        message: &OutgoingMessage,
    ) -> Result<MessageId, TransportError>;

    /// Replace the text (and buttons) of a message the bot sent earlier.
    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        message: &OutgoingMessage,
    ) -> Result<(), TransportError>;

    /// Acknowledge a button press, optionally with a short notice.
    async fn answer_button(&self, callback_id: &str, text: Option<&str>)
        -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lengths(parts: &[OutgoingMessage]) -> Vec<usize> {
        parts.iter().map(|p| p.text.chars().count()).collect()
    }

    #[test]
    fn short_message_is_left_alone() {
        let message = OutgoingMessage::plain("hello").with_buttons(vec![Button::new("Yes", "y")]);
        assert_eq!(message.split(MAX_MESSAGE_CHARS), vec![message.clone()]);
    }

    #[test]
    fn long_text_breaks_between_lines() {
        let line = format!("{}\n", "a".repeat(9));
        let message = OutgoingMessage::markdown(line.repeat(5));

        let parts = message.split(25);

        assert_eq!(lengths(&parts), vec![20, 20, 10]);
        assert!(parts.iter().all(|p| p.format == TextFormat::MarkdownV2));
        let joined: String = parts.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(joined, line.repeat(5));
    }

    #[test]
    fn overlong_line_never_splits_an_escape() {
        let message = OutgoingMessage::markdown("ab\\.".repeat(10));

        let parts = message.split(5);

        for part in &parts {
            assert!(part.text.chars().count() <= 5);
            let trailing = part.text.chars().rev().take_while(|c| *c == '\\').count();
            assert_eq!(trailing % 2, 0, "part ends inside an escape: {:?}", part.text);
        }
        assert_eq!(
            parts.iter().map(|p| p.text.as_str()).collect::<String>(),
            "ab\\.".repeat(10)
        );
    }

    #[test]
    fn buttons_ride_on_the_last_part() {
        let message =
            OutgoingMessage::plain("x\n".repeat(10)).with_buttons(vec![Button::new("Yes", "y")]);

        let parts = message.split(4);

        assert!(parts.len() > 1);
        assert!(parts[..parts.len() - 1].iter().all(|p| p.buttons.is_empty()));
        assert_eq!(parts.last().unwrap().buttons.len(), 1);
    }
}
