//! Telegram message channel
//!
//! Handles delivery of status messages and announcements through the
//! Telegram Bot API. Delivery is retried here, so callers only see a
//! failure once every attempt is exhausted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Retries after the first failed delivery attempt
pub const MAX_DELIVERY_RETRIES: u32 = 3;

/// Cap on the delay between delivery attempts
const MAX_DELIVERY_DELAY_SECS: u64 = 300;

/// Address of a conversation: a numeric id or a public `@username`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ChatId {
    Id(i64),
    Username(String),
}

impl From<i64> for ChatId {
    fn from(id: i64) -> Self {
        ChatId::Id(id)
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatId::Id(id) => write!(f, "{}", id),
            ChatId::Username(name) => f.write_str(name),
        }
    }
}

/// A delivered message, addressable for edits and replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub conversation_id: i64,
    pub message_id: i64,
}

/// Chat operations the pipeline needs
///
/// Texts use Markdown formatting; link previews are always disabled.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Posts a new message
    async fn send(&self, chat: ChatId, text: &str) -> Result<MessageRef>;

    /// Posts into `conversation_id` as a reply to `target`
    ///
    /// When `target` lives in another conversation the reply is threaded
    /// across conversations.
    async fn reply(&self, conversation_id: i64, target: MessageRef, text: &str) -> Result<MessageRef>;

    /// Replaces the text of an existing message
    async fn edit(&self, message: MessageRef, text: &str) -> Result<()>;
}

/// Delay before retry number `attempt` (0-based): `min(2^attempt, 300)` seconds
pub fn delivery_delay(attempt: u32) -> Duration {
    let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs.min(MAX_DELIVERY_DELAY_SECS))
}

/// Bot API implementation of MessageChannel
pub struct TelegramChannel {
    client: Client,
    endpoint: String,
}

impl TelegramChannel {
    /// Creates a new Telegram channel
    ///
    /// # Arguments
    /// * `api_url` - Bot API base URL (e.g., "https://api.telegram.org")
    /// * `bot_token` - Token of the bot posting the messages
    pub fn new(api_url: &str, bot_token: &str) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/bot{}", api_url.trim_end_matches('/'), bot_token),
        }
    }

    /// Calls a Bot API method, retrying rate limits and transient failures
    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let mut attempt = 0;

        loop {
            match self.call_once::<T>(method, &body).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < MAX_DELIVERY_RETRIES => {
                    let delay = e.retry_after().unwrap_or_else(|| delivery_delay(attempt));
                    warn!(
                        "Telegram {} failed (attempt {}/{}): {}; retrying in {:?}",
                        method,
                        attempt + 1,
                        MAX_DELIVERY_RETRIES + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Telegram {} failed", method));
                }
            }
        }
    }

    async fn call_once<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, BotApiError> {
        let url = format!("{}/{}", self.endpoint, method);
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status().as_u16();

        let parsed = response
            .json::<BotResponse<T>>()
            .await
            .map_err(|e| BotApiError::Api {
                status,
                description: format!("unreadable response: {}", e),
                retry_after: None,
            })?;

        match (parsed.ok, parsed.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(BotApiError::Api {
                status: parsed.error_code.unwrap_or(status),
                description: parsed.description.unwrap_or_default(),
                retry_after: parsed.parameters.and_then(|p| p.retry_after),
            }),
        }
    }
}

#[async_trait]
impl MessageChannel for TelegramChannel {
    async fn send(&self, chat: ChatId, text: &str) -> Result<MessageRef> {
        debug!("Sending message to {}", chat);

        let message: BotMessage = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat,
                    "text": text,
                    "parse_mode": "Markdown",
                    "link_preview_options": { "is_disabled": true },
                }),
            )
            .await?;

        Ok(message.into())
    }

    async fn reply(&self, conversation_id: i64, target: MessageRef, text: &str) -> Result<MessageRef> {
        let mut body = json!({
            "chat_id": conversation_id,
            "text": text,
            "parse_mode": "Markdown",
            "link_preview_options": { "is_disabled": true },
        });

        if target.conversation_id == conversation_id {
            body["reply_to_message_id"] = json!(target.message_id);
        } else {
            body["reply_parameters"] = json!({
                "message_id": target.message_id,
                "chat_id": target.conversation_id,
            });
        }

        let message: BotMessage = self.call("sendMessage", body).await?;

        Ok(message.into())
    }

    async fn edit(&self, message: MessageRef, text: &str) -> Result<()> {
        let body = json!({
            "chat_id": message.conversation_id,
            "message_id": message.message_id,
            "text": text,
            "parse_mode": "Markdown",
            "link_preview_options": { "is_disabled": true },
        });

        match self.call::<serde_json::Value>("editMessageText", body).await {
            Ok(_) => Ok(()),
            // Re-sending an identical status is harmless
            Err(e) if format!("{:#}", e).contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Channel used when no bot token is configured; messages only reach the log
pub struct LogOnlyChannel {
    next_id: AtomicI64,
}

impl LogOnlyChannel {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for LogOnlyChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageChannel for LogOnlyChannel {
    async fn send(&self, chat: ChatId, text: &str) -> Result<MessageRef> {
        info!("[chat {}] {}", chat, text);
        let conversation_id = match chat {
            ChatId::Id(id) => id,
            ChatId::Username(_) => 0,
        };
        Ok(MessageRef {
            conversation_id,
            message_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    async fn reply(&self, conversation_id: i64, target: MessageRef, text: &str) -> Result<MessageRef> {
        info!(
            "[chat {} reply to {}] {}",
            conversation_id, target.message_id, text
        );
        Ok(MessageRef {
            conversation_id,
            message_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        })
    }

    async fn edit(&self, message: MessageRef, text: &str) -> Result<()> {
        info!(
            "[chat {} edit {}] {}",
            message.conversation_id, message.message_id, text
        );
        Ok(())
    }
}

#[derive(Debug, Error)]
enum BotApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Bot API error {status}: {description}")]
    Api {
        status: u16,
        description: String,
        retry_after: Option<u64>,
    },
}

impl BotApiError {
    fn is_retryable(&self) -> bool {
        match self {
            BotApiError::Transport(_) => true,
            BotApiError::Api { status, .. } => *status == 429 || *status >= 500,
        }
    }

    /// Server-mandated wait on rate limits
    fn retry_after(&self) -> Option<Duration> {
        match self {
            BotApiError::Api {
                retry_after: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BotResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BotMessage {
    message_id: i64,
    chat: BotChat,
}

#[derive(Debug, Deserialize)]
struct BotChat {
    id: i64,
}

impl From<BotMessage> for MessageRef {
    fn from(message: BotMessage) -> Self {
        MessageRef {
            conversation_id: message.chat.id,
            message_id: message.message_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_delay_is_capped() {
        assert_eq!(delivery_delay(0), Duration::from_secs(1));
        assert_eq!(delivery_delay(1), Duration::from_secs(2));
        assert_eq!(delivery_delay(2), Duration::from_secs(4));
        assert_eq!(delivery_delay(9), Duration::from_secs(300));
        assert_eq!(delivery_delay(80), Duration::from_secs(300));
    }

    #[test]
    fn test_chat_id_serializes_untagged() {
        assert_eq!(serde_json::to_value(ChatId::Id(-100)).unwrap(), json!(-100));
        assert_eq!(
            serde_json::to_value(ChatId::Username("@android_dumps".to_string())).unwrap(),
            json!("@android_dumps")
        );
    }

    #[test]
    fn test_rate_limit_uses_server_delay() {
        let limited = BotApiError::Api {
            status: 429,
            description: "Too Many Requests: retry after 7".to_string(),
            retry_after: Some(7),
        };
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));

        let rejected = BotApiError::Api {
            status: 400,
            description: "chat not found".to_string(),
            retry_after: None,
        };
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn test_bot_message_parsing() {
        let raw = r#"{"ok":true,"result":{"message_id":42,"chat":{"id":-1001},"text":"hi"}}"#;
        let parsed: BotResponse<BotMessage> = serde_json::from_str(raw).unwrap();
        let message: MessageRef = parsed.result.unwrap().into();
        assert_eq!(
            message,
            MessageRef {
                conversation_id: -1001,
                message_id: 42
            }
        );
    }

    #[tokio::test]
    async fn test_log_only_channel_hands_out_distinct_ids() {
        let channel = LogOnlyChannel::new();
        let a = channel.send(ChatId::Id(5), "one").await.unwrap();
        let b = channel.reply(5, a, "two").await.unwrap();
        assert_eq!(a.conversation_id, 5);
        assert_ne!(a.message_id, b.message_id);
        channel.edit(a, "edited").await.unwrap();
    }
}
