//! Telegram Bot API transport
//!
//! Receives text messages via `getUpdates` long polling and answers with
//! `sendMessage`. Replies longer than Telegram's limit are split.

use super::{InboundMessage, Transport};
use crate::config::TelegramConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Maximum characters Telegram accepts in one message.
pub const MESSAGE_LIMIT: usize = 4096;
/// Timeout for non-polling API calls (seconds).
const API_TIMEOUT_SECS: u64 = 30;

pub struct TelegramTransport {
    client: Client,
    bot_token: String,
    config: TelegramConfig,
    /// Offset for the next `getUpdates` call (last update id + 1).
    next_offset: AtomicI64,
}

impl TelegramTransport {
    pub fn new(bot_token: impl Into<String>, config: TelegramConfig) -> Self {
        Self {
            client: Client::new(),
            bot_token: bot_token.into(),
            config,
            next_offset: AtomicI64::new(0),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.bot_token,
            method
        )
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.api_url(method))
            .json(&params)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        let body: TelegramResponse<T> = response
            .json()
            .await
            .map_err(|e| anyhow!("Telegram {} returned undecodable body ({}): {}", method, status, e))?;

        if !body.ok {
            return Err(anyhow!(
                "Telegram API error on {}: {}",
                method,
                body.description.unwrap_or_default()
            ));
        }

        body.result
            .ok_or_else(|| anyhow!("Telegram returned ok but no result for {}", method))
    }

    /// Verify the token by calling `getMe`.
    pub async fn get_me(&self) -> Result<TelegramUser> {
        self.call("getMe", json!({}), Duration::from_secs(API_TIMEOUT_SECS))
            .await
    }

    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn receive(&self) -> Result<Vec<InboundMessage>> {
        let params = json!({
            "offset": self.next_offset(),
            "timeout": self.config.polling_timeout_secs,
            "allowed_updates": ["message"],
        });
        let timeout = Duration::from_secs(self.config.polling_timeout_secs as u64 + 10);

        let updates: Vec<TelegramUpdate> = self.call("getUpdates", params, timeout).await?;

        if let Some(last) = updates.last() {
            self.next_offset.store(last.update_id + 1, Ordering::SeqCst);
        }

        Ok(updates.into_iter().filter_map(convert_update).collect())
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, MESSAGE_LIMIT) {
            let _: TelegramMessageResponse = self
                .call(
                    "sendMessage",
                    json!({ "chat_id": chat_id, "text": chunk }),
                    Duration::from_secs(API_TIMEOUT_SECS),
                )
                .await?;
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let _: bool = self
            .call(
                "sendChatAction",
                json!({ "chat_id": chat_id, "action": "typing" }),
                Duration::from_secs(API_TIMEOUT_SECS),
            )
            .await?;
        Ok(())
    }
}

/// Keep only updates carrying a text message from a known sender.
fn convert_update(update: TelegramUpdate) -> Option<InboundMessage> {
    let message = update.message?;
    let from = message.from?;
    let text = message.text?;
    Some(InboundMessage {
        chat_id: message.chat.id,
        user_id: from.id,
        text,
    })
}

/// Split `text` into chunks of at most `limit` characters, preferring to
/// break after a newline in the second half of a chunk.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let end = match rest.char_indices().nth(limit) {
            Some((index, _)) => index,
            None => {
                chunks.push(rest.to_string());
                break;
            }
        };

        let window = &rest[..end];
        let cut = match window.rfind('\n') {
            Some(newline) if window[..newline].chars().count() >= limit / 2 => newline + 1,
            _ => end,
        };

        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    chunks
}

// ============================================================================
// Telegram API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessageResponse {
    #[allow(dead_code)]
    message_id: i64,
}
