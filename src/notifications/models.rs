use serde::{Deserialize, Serialize};

/// A fully resolved channel configuration, ready for its sender. Credential
/// fallbacks (per-entry, global section, environment) have already been
/// applied; senders only validate that what remains is usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChannelConfig {
    #[serde(rename = "telegram")]
    Telegram { bot_token: String, chat_id: String },
    /// Push service addressed by a single shared key.
    #[serde(rename = "chat-webhook")]
    ChatWebhook { key: String },
    /// Operator-controlled endpoint receiving a structured payload.
    #[serde(rename = "generic-webhook")]
    Webhook {
        url: String,
        body_template: Option<String>,
    },
}

impl ChannelConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelConfig::Telegram { .. } => "telegram",
            ChannelConfig::ChatWebhook { .. } => "chat-webhook",
            ChannelConfig::Webhook { .. } => "generic-webhook",
        }
    }
}
