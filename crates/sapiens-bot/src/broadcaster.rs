// Outbound delivery: channel posts and per-user fan-out.

use std::sync::Arc;

use tracing::{debug, error, info};

use sapiens_core::model::UserId;

use crate::markup::{bold, escape_markdown_v2};
use crate::transport::{
    ChatId, ChatTransport, OutgoingMessage, TransportError, MAX_MESSAGE_CHARS,
};

/// Delivery counts of one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanOutReport {
    pub sent: usize,
    pub failed: usize,
}

pub struct Broadcaster {
    transport: Arc<dyn ChatTransport>,
    channel_id: Option<ChatId>,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn ChatTransport>, channel_id: Option<ChatId>) -> Self {
        Self {
            transport,
            channel_id,
        }
    }

    pub fn channel_configured(&self) -> bool {
        self.channel_id.is_some()
    }

    /// Post plain text to the channel. `false` when no channel is configured
    /// or a send attempt fails.
    pub async fn post_to_channel(&self, text: &str) -> bool {
        self.post_message(&OutgoingMessage::plain(text)).await
    }

    async fn post_message(&self, message: &OutgoingMessage) -> bool {
        let Some(channel_id) = self.channel_id else {
            debug!("Channel not configured, skipping channel post");
            return false;
        };
        match self.deliver(channel_id, message).await {
            Ok(()) => {
                info!("Posted to channel {channel_id}");
                true
            }
            Err(e) => {
                error!("Failed to post to channel {channel_id}: {e}. Check that the bot is an admin there.");
                false
            }
        }
    }

    /// Post a generated chronicle, credited to `creator`.
    pub async fn publish_chronicle(&self, chronicle: &str, creator: &str) -> bool {
        self.post_message(&chronicle_message(chronicle, creator))
            .await
    }

    /// Send `message` to each recipient in turn. A failed send is logged and
    /// counted; it never stops the remaining sends.
    pub async fn fan_out_to_users(
        &self,
        recipients: &[UserId],
        message: &OutgoingMessage,
    ) -> FanOutReport {
        let mut report = FanOutReport::default();
        for &recipient in recipients {
            match self.deliver(recipient, message).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    error!("Failed to send to user {recipient}: {e}");
                    report.failed += 1;
                }
            }
        }
        info!(
            "Fan-out finished: {} sent, {} failed",
            report.sent, report.failed
        );
        report
    }

    /// Send `message` in parts no longer than the chat limit, in order,
    /// stopping at the first failed part.
    async fn deliver(
        &self,
        chat_id: ChatId,
        message: &OutgoingMessage,
    ) -> Result<(), TransportError> {
        for part in message.split(MAX_MESSAGE_CHARS) {
            self.transport.send_message(chat_id, &part).await?;
        }
        Ok(())
    }
}

pub fn chronicle_message(chronicle: &str, creator: &str) -> OutgoingMessage {
    OutgoingMessage::markdown(format!(
        "\u{1F4DC} {}\n\n{}\n\n{} {}",
        bold("New Species Chronicle"),
        escape_markdown_v2(chronicle),
        bold("Chronicled by:"),
        escape_markdown_v2(creator),
    ))
}

pub fn daily_report_message(report: &str) -> OutgoingMessage {
    OutgoingMessage::markdown(format!(
        "\u{1F9EC} {}\n\n{}",
        bold("Daily Species Report"),
        escape_markdown_v2(report),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::transport::{MessageId, TextFormat};

    /// Records sends; fails for the listed chats.
    #[derive(Default)]
    struct RecordingTransport {
        failing: Vec<ChatId>,
        attempts: Mutex<Vec<(ChatId, OutgoingMessage)>>,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_message(
            &self,
            chat_id: ChatId,
            message: &OutgoingMessage,
        ) -> Result<MessageId, TransportError> {
            self.attempts.lock().unwrap().push((chat_id, message.clone()));
            if self.failing.contains(&chat_id) {
                Err(TransportError::Api {
                    code: 403,
                    description: "Forbidden".into(),
                })
            } else {
                Ok(1)
            }
        }

        async fn edit_message(
            &self,
            _chat_id: ChatId,
            _message_id: MessageId,
            _message: &OutgoingMessage,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn answer_button(
            &self,
            _callback_id: &str,
            _text: Option<&str>,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn no_channel_is_a_no_op() {
        let transport = Arc::new(RecordingTransport::default());
        let broadcaster = Broadcaster::new(transport.clone(), None);

        assert!(!broadcaster.channel_configured());
        assert!(!broadcaster.post_to_channel("hello").await);
        assert!(transport.attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn channel_post_single_attempt() {
        let transport = Arc::new(RecordingTransport {
            failing: vec![-100],
            ..Default::default()
        });
        let failing = Broadcaster::new(transport.clone(), Some(-100));
        assert!(!failing.post_to_channel("hello").await);
        assert_eq!(transport.attempts.lock().unwrap().len(), 1);

        let ok = Broadcaster::new(Arc::new(RecordingTransport::default()), Some(-200));
        assert!(ok.post_to_channel("hello").await);
    }

    #[tokio::test]
    async fn chronicle_is_escaped_markdown() {
        let transport = Arc::new(RecordingTransport::default());
        let broadcaster = Broadcaster::new(transport.clone(), Some(-100));

        assert!(broadcaster.publish_chronicle("Habitat: @sky_bot.", "Ada L.").await);

        let attempts = transport.attempts.lock().unwrap();
        let (chat, message) = &attempts[0];
        assert_eq!(*chat, -100);
        assert_eq!(message.format, TextFormat::MarkdownV2);
        assert!(message.text.contains("Habitat: @sky\\_bot\\."));
        assert!(message.text.contains("*Chronicled by:* Ada L\\."));
    }

    #[tokio::test]
    async fn fan_out_isolates_failures() {
        let transport = Arc::new(RecordingTransport {
            failing: vec![3],
            ..Default::default()
        });
        let broadcaster = Broadcaster::new(transport.clone(), None);

        let report = broadcaster
            .fan_out_to_users(&[1, 2, 3, 4, 5], &daily_report_message("All good."))
            .await;

        assert_eq!(report, FanOutReport { sent: 4, failed: 1 });
        let attempted: Vec<ChatId> = transport
            .attempts
            .lock()
            .unwrap()
            .iter()
            .map(|(chat, _)| *chat)
            .collect();
        assert_eq!(attempted, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn long_report_goes_out_in_parts() {
        let transport = Arc::new(RecordingTransport::default());
        let broadcaster = Broadcaster::new(transport.clone(), None);
        let report = format!("{}\n", "a".repeat(49)).repeat(100);
        assert_eq!(report.chars().count(), 5000);

        let outcome = broadcaster
            .fan_out_to_users(&[1, 2], &daily_report_message(&report))
            .await;

        assert_eq!(outcome, FanOutReport { sent: 2, failed: 0 });
        let attempts = transport.attempts.lock().unwrap();
        assert_eq!(attempts.len(), 4);
        assert!(attempts
            .iter()
            .all(|(_, message)| message.text.chars().count() <= MAX_MESSAGE_CHARS));
        let to_first: Vec<&str> = attempts
            .iter()
            .filter(|(chat, _)| *chat == 1)
            .map(|(_, message)| message.text.as_str())
            .collect();
        assert!(to_first[0].starts_with("\u{1F9EC} *Daily Species Report*"));
        assert_eq!(to_first.concat().matches(&"a".repeat(49)).count(), 100);
    }

    #[test]
    fn daily_report_has_bold_header() {
        let message = daily_report_message("Ecosystem grew (a lot)!");
        assert!(message.text.starts_with("\u{1F9EC} *Daily Species Report*"));
        assert!(message.text.ends_with("Ecosystem grew \\(a lot\\)\\!"));
    }
}
