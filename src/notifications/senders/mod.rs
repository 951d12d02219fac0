use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use super::models::ChannelConfig;

pub mod chat_webhook;
pub mod telegram;
pub mod webhook;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    #[error("failed to send notification: {0}")]
    SendFailed(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("templating error: {0}")]
    Templating(String),
}

/// A sender for one channel kind. Implementations validate their own
/// credentials before attempting a call, so a misconfigured channel fails
/// fast with `MissingCredentials` instead of a malformed request.
#[async_trait]
pub trait NotificationSender {
    /// Sends `message` through the channel described by `config`. `context`
    /// carries the structured fields of the transition (target name, states,
    /// timestamp) for channels that template or forward them.
    async fn send(
        &self,
        config: &ChannelConfig,
        message: &str,
        context: &HashMap<String, String>,
    ) -> Result<(), SenderError>;
}
