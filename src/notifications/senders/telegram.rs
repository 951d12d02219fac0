use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{NotificationSender, SenderError};
use crate::notifications::models::ChannelConfig;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// A sender for pushing notifications via the Telegram Bot API.
pub struct TelegramSender {
    client: Client,
}

impl Default for TelegramSender {
    fn default() -> Self {
        Self::new()
    }
}

impl TelegramSender {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap(), // Should not fail with default settings
        }
    }
}

/// Escapes text for Telegram MarkdownV2.
/// Characters to escape: _ * [ ] ( ) ~ ` > # + - = | { } . !
fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[derive(Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[async_trait]
impl NotificationSender for TelegramSender {
    async fn send(
        &self,
        config: &ChannelConfig,
        message: &str,
        _context: &HashMap<String, String>,
    ) -> Result<(), SenderError> {
        let (bot_token, chat_id) = match config {
            ChannelConfig::Telegram { bot_token, chat_id } => (bot_token, chat_id),
            _ => {
                return Err(SenderError::SendFailed(
                    "expected telegram config, found a different kind".to_string(),
                ));
            }
        };
        if bot_token.trim().is_empty() {
            return Err(SenderError::MissingCredentials("telegram bot token".to_string()));
        }
        if chat_id.trim().is_empty() {
            return Err(SenderError::MissingCredentials("telegram chat id".to_string()));
        }

        let api_url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
        let escaped = escape_markdown_v2(message);
        let payload = TelegramMessage {
            chat_id,
            text: &escaped,
            parse_mode: "MarkdownV2",
        };

        let response = self.client.post(&api_url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(SenderError::SendFailed(format!(
                "Telegram API returned non-success status: {status}. Body: {body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_escaping_covers_reserved_characters() {
        assert_eq!(escape_markdown_v2("a.b!c"), "a\\.b\\!c");
        assert_eq!(escape_markdown_v2("in stock → out of stock"), "in stock → out of stock");
    }

    #[tokio::test]
    async fn missing_chat_id_fails_fast() {
        let sender = TelegramSender::new();
        let config = ChannelConfig::Telegram {
            bot_token: "123:abc".to_string(),
            chat_id: String::new(),
        };
        let err = sender
            .send(&config, "hello", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::MissingCredentials(_)));
    }
}
