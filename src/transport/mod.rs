//! Messaging Transport Abstraction
//!
//! Information Hiding:
//! - Platform wire protocol (polling, offsets, message limits) hidden behind trait
//! - The relay only sees plain inbound texts and sends plain reply texts

use crate::storage::UserId;
use anyhow::Result;
use async_trait::async_trait;

pub mod telegram;

pub use telegram::TelegramTransport;

/// A text message delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Where the reply goes.
    pub chat_id: i64,
    /// Whose history the message belongs to.
    pub user_id: UserId,
    pub text: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next batch of inbound text messages. May return an empty batch.
    async fn receive(&self) -> Result<Vec<InboundMessage>>;

    /// Deliver a reply to a chat.
    async fn send(&self, chat_id: i64, text: &str) -> Result<()>;

    /// Show that a reply is being prepared.
    async fn send_typing(&self, _chat_id: i64) -> Result<()> {
        Ok(())
    }
}
