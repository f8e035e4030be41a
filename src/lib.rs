//! chatrelay - Telegram to LLM relay with bounded per-user memory
//!
//! Inbound texts are appended to a per-user history, sent with a persona
//! prompt to an OpenAI-compatible completion endpoint, and the reply is
//! recorded and delivered back to the chat.

pub mod cli;
pub mod config;
pub mod core;
pub mod relay;
pub mod storage;
pub mod transport;
pub mod utils;

pub use crate::config::Settings;
pub use crate::core::llm::{CompletionClient, CompletionError, OpenRouterClient};
pub use crate::core::turn::{Role, Turn};
pub use crate::relay::{MessageHandler, Relay};
pub use crate::storage::{ConversationStorage, MemoryStore, UserId};
pub use crate::transport::{InboundMessage, TelegramTransport, Transport};

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over `logging.level`.
pub fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Handler backed by a fresh in-memory store and the OpenRouter client.
pub fn build_handler(settings: &Settings, api_key: String) -> anyhow::Result<MessageHandler> {
    let store = Arc::new(MemoryStore::from_config(&settings.memory));
    let client = Arc::new(OpenRouterClient::new(api_key, settings.llm.clone())?);

    tracing::info!(
        model = %settings.llm.model,
        max_turns = store.max_turns(),
        "Message handler ready"
    );

    Ok(MessageHandler::new(store, client, settings))
}
