use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{NotificationSender, SenderError};
use crate::notifications::models::ChannelConfig;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// A sender for key-addressed chat push services (xizhi-style): the shared
/// key is the whole credential and routing information.
pub struct ChatWebhookSender {
    client: Client,
    endpoint_base: String,
}

impl Default for ChatWebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatWebhookSender {
    pub fn new() -> Self {
        Self::with_endpoint_base("https://xizhi.qqoq.net")
    }

    pub fn with_endpoint_base(base: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap(), // Should not fail with default settings
            endpoint_base: base.into(),
        }
    }
}

#[async_trait]
impl NotificationSender for ChatWebhookSender {
    async fn send(
        &self,
        config: &ChannelConfig,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<(), SenderError> {
        let key = match config {
            ChannelConfig::ChatWebhook { key } => key,
            _ => {
                return Err(SenderError::SendFailed(
                    "expected chat-webhook config, found a different kind".to_string(),
                ));
            }
        };
        if key.trim().is_empty() {
            return Err(SenderError::MissingCredentials("push key".to_string()));
        }

        let title = context
            .get("target_name")
            .map(|name| format!("{name} availability update"))
            .unwrap_or_else(|| "Availability update".to_string());
        let url = format!("{}/{key}.send", self.endpoint_base.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .form(&[("title", title.as_str()), ("content", message)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SenderError::SendFailed(format!(
                "push service returned non-success status: {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_fails_fast() {
        let sender = ChatWebhookSender::new();
        let config = ChannelConfig::ChatWebhook { key: String::new() };
        let err = sender
            .send(&config, "hello", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::MissingCredentials(_)));
    }
}
