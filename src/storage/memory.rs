//! In-Memory Conversation Storage
//!
//! Information Hiding:
//! - HashMap of per-user ring buffers hidden from users
//! - Atomic append-and-trim via a single RwLock around the map
//! - Least-recently-used users evicted once `max_users` is reached
//! - Optional idle expiry so abandoned conversations do not accumulate

use super::{ConversationStorage, UserId};
use crate::config::MemoryConfig;
use crate::core::turn::{Role, Turn};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

pub const DEFAULT_MAX_TURNS: usize = 20;
pub const DEFAULT_MAX_USERS: usize = 10_000;

struct Entry {
    turns: VecDeque<Turn>,
    last_seen: Instant,
    /// Recency stamp for LRU ordering; strictly increasing across writes.
    stamp: u64,
}

#[derive(Default)]
struct State {
    users: HashMap<UserId, Entry>,
    clock: u64,
}

/// In-memory store, lost when the process exits.
pub struct MemoryStore {
    state: RwLock<State>,
    max_turns: usize,
    max_users: usize,
    idle_ttl: Option<Duration>,
}

impl MemoryStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            state: RwLock::new(State::default()),
            max_turns: max_turns.max(1),
            max_users: DEFAULT_MAX_USERS,
            idle_ttl: None,
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        let store = Self::new(config.max_turns).with_max_users(config.max_users);
        match config.idle_ttl() {
            Some(ttl) => store.with_idle_ttl(ttl),
            None => store,
        }
    }

    pub fn with_max_users(mut self, max_users: usize) -> Self {
        self.max_users = max_users.max(1);
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        match self.idle_ttl {
            Some(ttl) => now.duration_since(entry.last_seen) > ttl,
            None => false,
        }
    }

    fn evict_for_new_user(&self, state: &mut State, now: Instant) {
        if state.users.len() < self.max_users {
            return;
        }

        if self.idle_ttl.is_some() {
            state.users.retain(|_, entry| !self.is_expired(entry, now));
            if state.users.len() < self.max_users {
                return;
            }
        }

        let oldest = state
            .users
            .iter()
            .min_by_key(|(_, entry)| entry.stamp)
            .map(|(user_id, _)| *user_id);

        if let Some(user_id) = oldest {
            state.users.remove(&user_id);
            tracing::debug!("[MemoryStore] Evicted least recently used user {}", user_id);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}

#[async_trait]
impl ConversationStorage for MemoryStore {
    async fn add_message(&self, user_id: UserId, role: Role, content: String) {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let expired = state
            .users
            .get(&user_id)
            .map_or(false, |entry| self.is_expired(entry, now));
        if expired {
            state.users.remove(&user_id);
        }

        if !state.users.contains_key(&user_id) {
            self.evict_for_new_user(&mut state, now);
        }

        state.clock += 1;
        let stamp = state.clock;

        let entry = state.users.entry(user_id).or_insert_with(|| Entry {
            turns: VecDeque::with_capacity(self.max_turns + 1),
            last_seen: now,
            stamp,
        });
        entry.turns.push_back(Turn::new(role, content));
        while entry.turns.len() > self.max_turns {
            entry.turns.pop_front();
        }
        entry.last_seen = now;
        entry.stamp = stamp;

        tracing::debug!(
            "[MemoryStore] Added {} turn for user {} ({} stored)",
            role,
            user_id,
            entry.turns.len()
        );
    }

    async fn get_history(&self, user_id: UserId) -> Vec<Turn> {
        let now = Instant::now();
        let state = self.state.read().await;
        match state.users.get(&user_id) {
            Some(entry) if !self.is_expired(entry, now) => entry.turns.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn max_turns(&self) -> usize {
        self.max_turns
    }

    async fn clear(&self, user_id: UserId) {
        let mut state = self.state.write().await;
        state.users.remove(&user_id);
        tracing::debug!("[MemoryStore] Cleared history for user {}", user_id);
    }

    async fn user_count(&self) -> usize {
        self.state.read().await.users.len()
    }

    async fn prune_expired(&self) -> usize {
        if self.idle_ttl.is_none() {
            return 0;
        }

        let now = Instant::now();
        let mut state = self.state.write().await;
        let before = state.users.len();
        state.users.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before - state.users.len();

        if removed > 0 {
            tracing::debug!("[MemoryStore] Pruned {} idle users", removed);
        }
        removed
    }
}
