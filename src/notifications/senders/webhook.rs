use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use tera::{Context, Tera};

use super::{NotificationSender, SenderError};
use crate::notifications::models::ChannelConfig;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// A sender for pushing notifications to an operator-controlled webhook.
///
/// The URL may embed `{message}`, which is substituted URL-encoded. The body
/// is the structured transition context as JSON, unless a Tera template is
/// configured, in which case the template renders against the same context.
pub struct WebhookSender {
    client: Client,
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookSender {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(SEND_TIMEOUT)
                .build()
                .unwrap(), // Should not fail with default settings
        }
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(
        &self,
        config: &ChannelConfig,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<(), SenderError> {
        let (url, body_template) = match config {
            ChannelConfig::Webhook { url, body_template } => (url, body_template),
            _ => {
                return Err(SenderError::SendFailed(
                    "expected generic-webhook config, found a different kind".to_string(),
                ));
            }
        };
        if url.trim().is_empty() {
            return Err(SenderError::MissingCredentials("webhook url".to_string()));
        }

        let resolved_url = if url.contains("{message}") {
            url.replace("{message}", &urlencoding::encode(message))
        } else {
            url.clone()
        };

        let body = match body_template {
            Some(template) => {
                let mut tera_context = Context::new();
                for (key, value) in context {
                    tera_context.insert(key, value);
                }
                Tera::one_off(template, &tera_context, true)
                    .map_err(|e| SenderError::Templating(e.to_string()))?
            }
            None => serde_json::to_string(context)
                .map_err(|e| SenderError::SendFailed(e.to_string()))?,
        };

        let response = self
            .client
            .post(&resolved_url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            return Err(SenderError::SendFailed(format!(
                "webhook returned non-success status: {status}. Body: {error_body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_url_fails_fast() {
        let sender = WebhookSender::new();
        let config = ChannelConfig::Webhook {
            url: String::new(),
            body_template: None,
        };
        let err = sender
            .send(&config, "hello", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn broken_template_reports_templating_error() {
        let sender = WebhookSender::new();
        let config = ChannelConfig::Webhook {
            url: "http://127.0.0.1:1/hook".to_string(),
            body_template: Some("{{ unclosed".to_string()),
        };
        let err = sender
            .send(&config, "hello", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SenderError::Templating(_)));
    }
}
