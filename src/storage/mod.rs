//! Conversation Storage Abstraction
//!
//! Information Hiding:
//! - Per-user history bounds and eviction hidden behind the trait
//! - Callers only ever see cloned snapshots, never the stored sequence
//! - Handlers receive the store as a dependency, there is no global instance

use crate::core::turn::{Role, Turn};
use async_trait::async_trait;

pub mod memory;

pub use memory::MemoryStore;

/// Platform-defined user identifier (Telegram user ids are 64-bit integers).
pub type UserId = i64;

/// Bounded per-user conversation memory.
///
/// None of the operations can fail; an unknown user simply has an empty history.
#[async_trait]
pub trait ConversationStorage: Send + Sync {
    /// Append a turn to the user's history, evicting the oldest turns past the cap.
    async fn add_message(&self, user_id: UserId, role: Role, content: String);

    /// Snapshot of the user's history in insertion order.
    async fn get_history(&self, user_id: UserId) -> Vec<Turn>;

    /// Per-user history cap.
    fn max_turns(&self) -> usize;

    /// Forget everything stored for the user.
    async fn clear(&self, user_id: UserId);

    /// Number of users currently tracked.
    async fn user_count(&self) -> usize;

    /// Drop idle users. Returns how many were removed.
    async fn prune_expired(&self) -> usize {
        0
    }
}
