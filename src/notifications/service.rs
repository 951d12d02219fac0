//! Channel resolution and fan-out dispatch of transition notifications.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{info, warn};

use super::models::ChannelConfig;
use super::senders::{
    chat_webhook::ChatWebhookSender, telegram::TelegramSender, webhook::WebhookSender,
    NotificationSender, SenderError,
};
use crate::config::MonitorConfig;
use crate::judge::Availability;
use crate::state::CheckResult;

#[derive(Debug)]
pub struct ChannelDelivery {
    pub kind: &'static str,
    pub result: Result<(), SenderError>,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// A notification for this target already went out within the cooldown
    /// window; nothing was sent, the state recording is unaffected.
    Suppressed { since_last: Duration },
    /// One entry per channel, in configuration order. A failed channel never
    /// prevents delivery to the rest.
    Sent(Vec<ChannelDelivery>),
}

/// Routes one transition event to every matching channel, isolating failures
/// per channel and bounding notification storms with a per-target cooldown.
pub struct NotificationDispatcher {
    telegram: TelegramSender,
    chat_webhook: ChatWebhookSender,
    webhook: WebhookSender,
    last_notified: DashMap<String, Instant>,
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self {
            telegram: TelegramSender::new(),
            chat_webhook: ChatWebhookSender::new(),
            webhook: WebhookSender::new(),
            last_notified: DashMap::new(),
        }
    }

    pub async fn dispatch(
        &self,
        target_name: &str,
        url: &str,
        previous: Option<Availability>,
        result: &CheckResult,
        channels: &[ChannelConfig],
        cooldown: Duration,
    ) -> DispatchOutcome {
        if let Some(last) = self.last_notified.get(target_name) {
            let since_last = last.elapsed();
            if since_last < cooldown {
                info!(
                    target_name,
                    since_secs = since_last.as_secs(),
                    "notification suppressed by cooldown"
                );
                return DispatchOutcome::Suppressed { since_last };
            }
        }

        let message = render_message(target_name, url, previous, result);
        let context = build_context(target_name, url, previous, result);

        let mut deliveries = Vec::with_capacity(channels.len());
        for config in channels {
            let outcome = match config {
                ChannelConfig::Telegram { .. } => {
                    self.telegram.send(config, &message, &context).await
                }
                ChannelConfig::ChatWebhook { .. } => {
                    self.chat_webhook.send(config, &message, &context).await
                }
                ChannelConfig::Webhook { .. } => {
                    self.webhook.send(config, &message, &context).await
                }
            };
            match &outcome {
                Ok(()) => info!(target_name, channel = config.kind(), "notification sent"),
                Err(e) => warn!(
                    target_name,
                    channel = config.kind(),
                    error = %e,
                    "notification delivery failed"
                ),
            }
            deliveries.push(ChannelDelivery {
                kind: config.kind(),
                result: outcome,
            });
        }

        if !deliveries.is_empty() {
            self.last_notified
                .insert(target_name.to_string(), Instant::now());
        }
        DispatchOutcome::Sent(deliveries)
    }
}

/// Deterministic notification text for a transition.
pub fn render_message(
    target_name: &str,
    url: &str,
    previous: Option<Availability>,
    result: &CheckResult,
) -> String {
    let old = previous.map(|a| a.label()).unwrap_or("unknown");
    format!(
        "📢 {target_name} availability changed\nStatus: {old} → {new}\nLink: {url}\nTime: {time} UTC\nDetail: {detail}",
        new = result.availability.label(),
        time = result.timestamp.format("%Y-%m-%d %H:%M:%S"),
        detail = result.message,
    )
}

fn build_context(
    target_name: &str,
    url: &str,
    previous: Option<Availability>,
    result: &CheckResult,
) -> HashMap<String, String> {
    let mut context = HashMap::new();
    context.insert("target_name".to_string(), target_name.to_string());
    context.insert("url".to_string(), url.to_string());
    context.insert(
        "availability".to_string(),
        result.availability.to_string(),
    );
    context.insert(
        "previous".to_string(),
        previous
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    );
    context.insert("message".to_string(), result.message.clone());
    context.insert(
        "timestamp".to_string(),
        result.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    context.insert("elapsed_ms".to_string(), result.elapsed_ms.to_string());
    context
}

/// Collects the channels that apply to `target_name`: every enabled entry
/// that is global or scoped to this target, with empty credentials filled
/// from the global section and then the environment. Documents that predate
/// the channel list fall back to whatever the global section configures.
pub fn resolve_channels(config: &MonitorConfig, target_name: &str) -> Vec<ChannelConfig> {
    let globals = &config.config;
    let mut resolved = Vec::new();

    for entry in &config.channels {
        if !entry.enabled {
            continue;
        }
        if entry
            .target
            .as_deref()
            .is_some_and(|scope| scope != target_name)
        {
            continue;
        }
        match entry.kind.as_str() {
            "telegram" => {
                let env_token = env_var("TELEGRAM_BOT_TOKEN");
                resolved.push(ChannelConfig::Telegram {
                    bot_token: first_non_empty(&[
                        entry.bot_token.as_str(),
                        globals.telegram_bot_token.as_str(),
                        env_token.as_str(),
                    ]),
                    chat_id: first_non_empty(&[
                        entry.chat_id.as_str(),
                        globals.telegram_chat_id.as_str(),
                    ]),
                });
            }
            "chat-webhook" => {
                let env_key = env_var("PUSH_KEY");
                resolved.push(ChannelConfig::ChatWebhook {
                    key: first_non_empty(&[
                        entry.key.as_str(),
                        globals.push_key.as_str(),
                        env_key.as_str(),
                    ]),
                });
            }
            "generic-webhook" => {
                resolved.push(ChannelConfig::Webhook {
                    url: first_non_empty(&[entry.url.as_str(), globals.webhook_url.as_str()]),
                    body_template: entry.body_template.clone(),
                });
            }
            other => warn!(channel_kind = other, "unsupported channel kind, skipping"),
        }
    }

    if config.channels.is_empty() {
        if !globals.telegram_bot_token.is_empty() || !globals.telegram_chat_id.is_empty() {
            resolved.push(ChannelConfig::Telegram {
                bot_token: globals.telegram_bot_token.clone(),
                chat_id: globals.telegram_chat_id.clone(),
            });
        }
        if !globals.push_key.is_empty() {
            resolved.push(ChannelConfig::ChatWebhook {
                key: globals.push_key.clone(),
            });
        }
        if !globals.webhook_url.is_empty() {
            resolved.push(ChannelConfig::Webhook {
                url: globals.webhook_url.clone(),
                body_template: None,
            });
        }
    }

    resolved
}

fn env_var(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn first_non_empty(candidates: &[&str]) -> String {
    candidates
        .iter()
        .find(|c| !c.trim().is_empty())
        .map(|c| c.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelEntry;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sample_result(availability: Availability) -> CheckResult {
        CheckResult {
            timestamp: Utc::now(),
            availability,
            message: "matched text \"Add to cart\"".to_string(),
            elapsed_ms: 42,
        }
    }

    fn telegram_without_chat_id() -> ChannelConfig {
        ChannelConfig::Telegram {
            bot_token: "123:abc".to_string(),
            chat_id: String::new(),
        }
    }

    fn entry(kind: &str) -> ChannelEntry {
        ChannelEntry {
            kind: kind.to_string(),
            enabled: true,
            target: None,
            bot_token: String::new(),
            chat_id: String::new(),
            key: String::new(),
            url: String::new(),
            body_template: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Accepts one HTTP request, replies 200 and hands back the raw request.
    async fn capture_one_request() -> (
        std::net::SocketAddr,
        tokio::sync::oneshot::Receiver<String>,
    ) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut raw = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => {
                            raw.extend_from_slice(&chunk[..n]);
                            if request_complete(&raw) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    )
                    .await;
                let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
            }
        });
        (addr, rx)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        match text.find("\r\n\r\n") {
            Some(idx) => {
                let body_len = text[..idx]
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .and_then(|v| v.trim().parse::<usize>().ok())
                    })
                    .unwrap_or(0);
                raw.len() >= idx + 4 + body_len
            }
            None => false,
        }
    }

    #[tokio::test]
    async fn second_transition_within_cooldown_is_suppressed() {
        let dispatcher = NotificationDispatcher::new();
        let channels = vec![telegram_without_chat_id()];
        let result = sample_result(Availability::Available);

        let first = dispatcher
            .dispatch(
                "widget",
                "http://example.com",
                None,
                &result,
                &channels,
                Duration::from_secs(300),
            )
            .await;
        assert!(matches!(first, DispatchOutcome::Sent(_)));

        let second = dispatcher
            .dispatch(
                "widget",
                "http://example.com",
                Some(Availability::Available),
                &sample_result(Availability::Unavailable),
                &channels,
                Duration::from_secs(300),
            )
            .await;
        assert!(matches!(second, DispatchOutcome::Suppressed { .. }));
    }

    #[tokio::test]
    async fn cooldown_is_per_target() {
        let dispatcher = NotificationDispatcher::new();
        let channels = vec![telegram_without_chat_id()];
        let result = sample_result(Availability::Available);

        dispatcher
            .dispatch(
                "widget",
                "http://example.com",
                None,
                &result,
                &channels,
                Duration::from_secs(300),
            )
            .await;
        let other = dispatcher
            .dispatch(
                "gadget",
                "http://example.com",
                None,
                &result,
                &channels,
                Duration::from_secs(300),
            )
            .await;
        assert!(matches!(other, DispatchOutcome::Sent(_)));
    }

    #[tokio::test]
    async fn channel_failure_does_not_block_remaining_channels() {
        let (addr, received) = capture_one_request().await;
        let dispatcher = NotificationDispatcher::new();
        let channels = vec![
            telegram_without_chat_id(),
            ChannelConfig::Webhook {
                url: format!("http://{addr}/hook"),
                body_template: None,
            },
        ];

        let outcome = dispatcher
            .dispatch(
                "widget",
                "http://example.com",
                Some(Availability::Unavailable),
                &sample_result(Availability::Available),
                &channels,
                Duration::from_secs(300),
            )
            .await;

        let deliveries = match outcome {
            DispatchOutcome::Sent(d) => d,
            other => panic!("expected Sent, got {other:?}"),
        };
        assert_eq!(deliveries.len(), 2);
        assert!(matches!(
            deliveries[0].result,
            Err(SenderError::MissingCredentials(_))
        ));
        assert!(deliveries[1].result.is_ok());

        let request = received.await.unwrap();
        assert!(request.contains("widget"));
        assert!(request.contains("available"));
    }

    #[test]
    fn message_is_deterministic_for_the_same_inputs() {
        let result = sample_result(Availability::Available);
        let a = render_message("widget", "http://example.com", Some(Availability::Unavailable), &result);
        let b = render_message("widget", "http://example.com", Some(Availability::Unavailable), &result);
        assert_eq!(a, b);
        assert!(a.contains("widget"));
        assert!(a.contains("out of stock → in stock"));
        assert!(a.contains("http://example.com"));
        assert!(a.contains("matched text"));
    }

    #[test]
    fn resolution_honors_scope_and_enabled_flag() {
        let mut config = MonitorConfig::default();
        config.channels.push(entry("telegram")); // global
        let mut scoped = entry("generic-webhook");
        scoped.target = Some("other".to_string());
        scoped.url = "http://example.com/hook".to_string();
        config.channels.push(scoped);
        let mut disabled = entry("chat-webhook");
        disabled.enabled = false;
        config.channels.push(disabled);

        let resolved = resolve_channels(&config, "widget");
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].kind(), "telegram");

        let resolved = resolve_channels(&config, "other");
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn entry_credentials_fall_back_to_global_section() {
        let mut config = MonitorConfig::default();
        config.config.telegram_bot_token = "global-token".to_string();
        config.config.telegram_chat_id = "global-chat".to_string();
        let mut channel = entry("telegram");
        channel.chat_id = "entry-chat".to_string();
        config.channels.push(channel);

        let resolved = resolve_channels(&config, "widget");
        match &resolved[0] {
            ChannelConfig::Telegram { bot_token, chat_id } => {
                assert_eq!(bot_token, "global-token");
                assert_eq!(chat_id, "entry-chat");
            }
            other => panic!("expected telegram, got {other:?}"),
        }
    }

    #[test]
    fn legacy_document_synthesizes_channels_from_globals() {
        let mut config = MonitorConfig::default();
        config.config.push_key = "k-123".to_string();
        config.config.webhook_url = "http://example.com/hook".to_string();

        let resolved = resolve_channels(&config, "widget");
        let kinds: Vec<_> = resolved.iter().map(|c| c.kind()).collect();
        assert_eq!(kinds, vec!["chat-webhook", "generic-webhook"]);
    }
}
