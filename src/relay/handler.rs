//! Message Handler - one inbound text in, one reply text out
//!
//! Information Hiding:
//! - Context window assembly (persona prompt + stored history) hidden
//! - Completion failures converted to fixed user-facing replies here,
//!   nothing propagates to the transport
//! - Failure policy decides whether an unanswered user turn is kept
//!
//! A message consisting only of `/start` or `/reset` is answered locally;
//! every other text, including `/reset now`, goes to the model as a user turn.

use crate::config::{FailurePolicy, RepliesConfig, Settings};
use crate::core::llm::{CompletionClient, CompletionError};
use crate::core::turn::{Role, Turn};
use crate::storage::{ConversationStorage, UserId};
use std::sync::Arc;

/// Bot commands answered locally without a completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Reset,
}

impl Command {
    /// Recognizes a bare `/start` or `/reset`, including the `/cmd@botname` form.
    pub fn parse(text: &str) -> Option<Self> {
        let name = text.trim().strip_prefix('/')?;
        let name = name.split('@').next().unwrap_or(name);
        match name {
            "start" => Some(Command::Start),
            "reset" => Some(Command::Reset),
            _ => None,
        }
    }
}

pub struct MessageHandler {
    store: Arc<dyn ConversationStorage>,
    client: Arc<dyn CompletionClient>,
    model: String,
    system_prompt: String,
    replies: RepliesConfig,
    on_failure: FailurePolicy,
}

impl MessageHandler {
    pub fn new(
        store: Arc<dyn ConversationStorage>,
        client: Arc<dyn CompletionClient>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            client,
            model: settings.llm.model.clone(),
            system_prompt: settings.persona.system_prompt.clone(),
            replies: settings.replies.clone(),
            on_failure: settings.memory.on_failure,
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStorage> {
        &self.store
    }

    /// Handle one inbound message and produce the reply to deliver.
    ///
    /// Exactly one completion attempt is made. Only real model output is ever
    /// recorded as an assistant turn.
    pub async fn handle(&self, user_id: UserId, text: &str) -> String {
        if let Some(command) = Command::parse(text) {
            return self.handle_command(user_id, command).await;
        }

        tracing::info!(user_id, chars = text.chars().count(), "Received message");

        match self.on_failure {
            FailurePolicy::Keep => {
                self.store
                    .add_message(user_id, Role::User, text.to_string())
                    .await;
                let messages = self.build_context(user_id, None).await;
                match self.client.complete(&self.model, &messages).await {
                    Ok(reply) => {
                        self.store
                            .add_message(user_id, Role::Assistant, reply.clone())
                            .await;
                        reply
                    }
                    Err(e) => self.failure_reply(user_id, &e),
                }
            }
            // The user turn is only recorded once the exchange succeeded, so a
            // failure leaves the stored history exactly as it was.
            FailurePolicy::Rollback => {
                let pending = Turn::user(text);
                let messages = self.build_context(user_id, Some(pending)).await;
                match self.client.complete(&self.model, &messages).await {
                    Ok(reply) => {
                        self.store
                            .add_message(user_id, Role::User, text.to_string())
                            .await;
                        self.store
                            .add_message(user_id, Role::Assistant, reply.clone())
                            .await;
                        reply
                    }
                    Err(e) => self.failure_reply(user_id, &e),
                }
            }
        }
    }

    fn failure_reply(&self, user_id: UserId, error: &CompletionError) -> String {
        if error.is_rate_limited() {
            tracing::warn!(user_id, "Rate limit reached (429), asking user to wait");
            self.replies.rate_limited.clone()
        } else {
            tracing::error!(user_id, error = %error, "Completion request failed");
            self.replies.failure.clone()
        }
    }

    /// Persona prompt followed by the user's stored history. A `pending` turn
    /// not yet in the store is appended, dropping the oldest stored turn when
    /// needed so the window matches what the store would hold.
    async fn build_context(&self, user_id: UserId, pending: Option<Turn>) -> Vec<Turn> {
        let mut history = self.store.get_history(user_id).await;
        if pending.is_some() {
            let keep = self.store.max_turns().saturating_sub(1);
            if history.len() > keep {
                history.drain(..history.len() - keep);
            }
        }

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Turn::system(self.system_prompt.as_str()));
        messages.extend(history);
        messages.extend(pending);
        messages
    }

    async fn handle_command(&self, user_id: UserId, command: Command) -> String {
        tracing::info!(user_id, ?command, "Received command");
        match command {
            Command::Start => self.replies.greeting.clone(),
            Command::Reset => {
                self.store.clear(user_id).await;
                self.replies.reset.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    enum Outcome {
        Reply(&'static str),
        RateLimited,
        ServerError,
    }

    /// Returns a fixed outcome and records every payload it was given.
    struct StubClient {
        outcome: Outcome,
        calls: Mutex<Vec<(String, Vec<Turn>)>>,
    }

    impl StubClient {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Vec<Turn>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionClient for StubClient {
        async fn complete(
            &self,
            model: &str,
            messages: &[Turn],
        ) -> Result<String, CompletionError> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), messages.to_vec()));
            match self.outcome {
                Outcome::Reply(text) => Ok(text.to_string()),
                Outcome::RateLimited => Err(CompletionError::RateLimited),
                Outcome::ServerError => Err(CompletionError::Status {
                    status: 502,
                    body: "bad gateway".to_string(),
                }),
            }
        }
    }

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.llm.model = "test/model".to_string();
        settings.persona.system_prompt = "persona".to_string();
        settings
    }

    fn handler(client: Arc<StubClient>) -> (MessageHandler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let handler = MessageHandler::new(store.clone(), client, &settings());
        (handler, store)
    }

    #[tokio::test]
    async fn test_success_records_both_turns() {
        let client = StubClient::new(Outcome::Reply("X"));
        let (handler, store) = handler(client.clone());

        let reply = handler.handle(5, "hi").await;

        assert_eq!(reply, "X");
        assert_eq!(
            store.get_history(5).await,
            vec![Turn::user("hi"), Turn::assistant("X")]
        );

        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "test/model");
        assert_eq!(calls[0].1, vec![Turn::system("persona"), Turn::user("hi")]);
    }

    #[tokio::test]
    async fn test_context_includes_prior_turns() {
        let client = StubClient::new(Outcome::Reply("ok"));
        let (handler, _store) = handler(client.clone());

        handler.handle(1, "first").await;
        handler.handle(1, "second").await;

        let calls = client.calls();
        assert_eq!(
            calls[1].1,
            vec![
                Turn::system("persona"),
                Turn::user("first"),
                Turn::assistant("ok"),
                Turn::user("second"),
            ]
        );
    }

    #[tokio::test]
    async fn test_rate_limit_keeps_only_user_turn() {
        let client = StubClient::new(Outcome::RateLimited);
        let (handler, store) = handler(client.clone());

        let reply = handler.handle(9, "hello").await;

        assert_eq!(reply, RepliesConfig::default().rate_limited);
        assert_eq!(store.get_history(9).await, vec![Turn::user("hello")]);
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_generic_failure_returns_failure_text() {
        let client = StubClient::new(Outcome::ServerError);
        let (handler, store) = handler(client);

        let reply = handler.handle(9, "hello").await;

        assert_eq!(reply, RepliesConfig::default().failure);
        let history = store.get_history(9).await;
        assert!(history.iter().all(|turn| turn.role != Role::Assistant));
    }

    #[tokio::test]
    async fn test_rollback_policy_leaves_history_unchanged() {
        let client = StubClient::new(Outcome::ServerError);
        let store = Arc::new(MemoryStore::default());
        store
            .add_message(3, Role::User, "earlier".to_string())
            .await;
        let handler = MessageHandler::new(store.clone(), client, &settings())
            .with_failure_policy(FailurePolicy::Rollback);

        handler.handle(3, "lost").await;

        assert_eq!(store.get_history(3).await, vec![Turn::user("earlier")]);
    }

    #[tokio::test]
    async fn test_rollback_at_cap_keeps_oldest_turn() {
        let client = StubClient::new(Outcome::RateLimited);
        let store = Arc::new(MemoryStore::new(3));
        for text in ["A", "B", "C"] {
            store.add_message(8, Role::User, text.to_string()).await;
        }
        let before = store.get_history(8).await;
        let handler = MessageHandler::new(store.clone(), client.clone(), &settings())
            .with_failure_policy(FailurePolicy::Rollback);

        handler.handle(8, "D").await;

        assert_eq!(store.get_history(8).await, before);
        // the request window still holds at most three turns besides the persona
        assert_eq!(
            client.calls()[0].1,
            vec![
                Turn::system("persona"),
                Turn::user("B"),
                Turn::user("C"),
                Turn::user("D"),
            ]
        );
    }

    #[tokio::test]
    async fn test_rollback_success_records_exchange() {
        let client = StubClient::new(Outcome::Reply("X"));
        let store = Arc::new(MemoryStore::new(3));
        for text in ["A", "B", "C"] {
            store.add_message(8, Role::User, text.to_string()).await;
        }
        let handler = MessageHandler::new(store.clone(), client, &settings())
            .with_failure_policy(FailurePolicy::Rollback);

        let reply = handler.handle(8, "D").await;

        assert_eq!(reply, "X");
        assert_eq!(
            store.get_history(8).await,
            vec![Turn::user("C"), Turn::user("D"), Turn::assistant("X")]
        );
    }

    #[tokio::test]
    async fn test_empty_text_is_forwarded() {
        let client = StubClient::new(Outcome::Reply("?"));
        let (handler, store) = handler(client.clone());

        handler.handle(2, "").await;

        assert_eq!(client.calls()[0].1[1], Turn::user(""));
        assert_eq!(store.get_history(2).await.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_command_clears_history() {
        let client = StubClient::new(Outcome::Reply("ok"));
        let (handler, store) = handler(client.clone());

        handler.handle(4, "remember me").await;
        let reply = handler.handle(4, "/reset").await;

        assert_eq!(reply, RepliesConfig::default().reset);
        assert!(store.get_history(4).await.is_empty());
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_start_command_does_not_touch_history() {
        let client = StubClient::new(Outcome::Reply("ok"));
        let (handler, store) = handler(client.clone());

        let reply = handler.handle(4, "/start@relay_bot").await;

        assert_eq!(reply, RepliesConfig::default().greeting);
        assert!(store.get_history(4).await.is_empty());
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_command_with_arguments_goes_to_model() {
        let client = StubClient::new(Outcome::Reply("ok"));
        let (handler, store) = handler(client.clone());

        handler.handle(6, "earlier").await;
        let reply = handler.handle(6, "/reset now").await;

        assert_eq!(reply, "ok");
        assert_eq!(client.calls().len(), 2);
        assert_eq!(store.get_history(6).await[2], Turn::user("/reset now"));
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("  /reset  "), Some(Command::Reset));
        assert_eq!(Command::parse("/reset now"), None);
        assert_eq!(Command::parse("/start please"), None);
        assert_eq!(Command::parse("/reset@some_bot"), Some(Command::Reset));
        assert_eq!(Command::parse("/help"), None);
        assert_eq!(Command::parse("start"), None);
        assert_eq!(Command::parse(""), None);
    }
}
