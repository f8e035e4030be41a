use crate::config::Settings;
use crate::relay::handler::MessageHandler;
use crate::transport::{InboundMessage, Transport};
use std::sync::Arc;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Back-off after a failed polling round.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Event loop between a [`Transport`] and the [`MessageHandler`].
///
/// Polling runs in its own task and feeds a bounded channel; every inbound
/// message is handled in a separate task so one slow completion never holds
/// up other users.
pub struct Relay {
    handler: Arc<MessageHandler>,
    transport: Arc<dyn Transport>,
    buffer_size: usize,
    prune_interval: Duration,
}

impl Relay {
    pub fn new(
        handler: Arc<MessageHandler>,
        transport: Arc<dyn Transport>,
        settings: &Settings,
    ) -> Self {
        Self {
            handler,
            transport,
            buffer_size: settings.system.channel_buffer_size.max(1),
            prune_interval: settings.memory.prune_interval(),
        }
    }

    /// Run until `shutdown` flips to `true`, then wait for in-flight replies.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (sender, mut receiver) = channel(self.buffer_size);
        let poller = tokio::spawn(poll_loop(
            self.transport.clone(),
            sender,
            shutdown.clone(),
        ));

        let mut janitor = interval(self.prune_interval);
        janitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tasks = JoinSet::new();

        tracing::info!("Relay started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Relay received shutdown signal");
                        break;
                    }
                }
                message = receiver.recv() => match message {
                    Some(message) => {
                        tasks.spawn(deliver(self.handler.clone(), self.transport.clone(), message));
                    }
                    None => {
                        tracing::info!("Polling channel closed, shutting down");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Message task panicked: {}", e);
                    }
                }
                _ = janitor.tick() => {
                    let pruned = self.handler.store().prune_expired().await;
                    if pruned > 0 {
                        tracing::info!(pruned, "Pruned idle conversations");
                    }
                }
            }
        }

        self.drain_pending(&mut receiver, &mut tasks).await;
        if let Err(e) = poller.await {
            tracing::error!("Polling task failed: {}", e);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Message task panicked: {}", e);
            }
        }

        tracing::info!("Relay stopped");
    }

    /// Answer everything the poller still hands over until it lets go of the
    /// channel. Those updates are already acknowledged and would not be
    /// delivered again.
    async fn drain_pending(&self, receiver: &mut Receiver<InboundMessage>, tasks: &mut JoinSet<()>) {
        let mut pending = 0usize;
        while let Some(message) = receiver.recv().await {
            tasks.spawn(deliver(self.handler.clone(), self.transport.clone(), message));
            pending += 1;
        }
        if pending > 0 {
            tracing::info!(pending, "Answering queued messages before shutdown");
        }
    }
}

/// Resolves once shutdown is requested or the signal sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Polls until shutdown. Only a pending `receive` is cancelled; a batch that
/// was already received is always handed over in full.
async fn poll_loop(
    transport: Arc<dyn Transport>,
    sender: Sender<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Polling for updates");

    loop {
        let result = tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            result = transport.receive() => result,
        };

        match result {
            Ok(messages) => {
                for message in messages {
                    if sender.send(message).await.is_err() {
                        tracing::warn!("Message receiver dropped, stopping polling");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!("Polling error: {}", e);
                tokio::select! {
                    _ = stopped(&mut shutdown) => break,
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    tracing::info!("Polling stopped");
}

/// Handle one message and send the reply back to its chat.
async fn deliver(
    handler: Arc<MessageHandler>,
    transport: Arc<dyn Transport>,
    message: InboundMessage,
) {
    if let Err(e) = transport.send_typing(message.chat_id).await {
        tracing::debug!(chat_id = message.chat_id, "Typing indicator failed: {}", e);
    }

    let reply = handler.handle(message.user_id, &message.text).await;

    if let Err(e) = transport.send(message.chat_id, &reply).await {
        tracing::error!(chat_id = message.chat_id, "Failed to deliver reply: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::{CompletionClient, CompletionError};
    use crate::core::turn::Turn;
    use crate::storage::{ConversationStorage, MemoryStore};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out queued batches, then blocks like an idle long poll.
    struct FakeTransport {
        batches: Mutex<VecDeque<Vec<InboundMessage>>>,
        sent: Mutex<Vec<(i64, String)>>,
        fail_first_poll: Mutex<bool>,
    }

    impl FakeTransport {
        fn new(batches: Vec<Vec<InboundMessage>>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into()),
                sent: Mutex::new(Vec::new()),
                fail_first_poll: Mutex::new(false),
            })
        }

        fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn receive(&self) -> Result<Vec<InboundMessage>> {
            {
                let mut fail = self.fail_first_poll.lock().unwrap();
                if *fail {
                    *fail = false;
                    anyhow::bail!("network down");
                }
            }
            let next = self.batches.lock().unwrap().pop_front();
            match next {
                Some(batch) => Ok(batch),
                None => std::future::pending().await,
            }
        }

        async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    struct EchoClient;

    #[async_trait]
    impl CompletionClient for EchoClient {
        async fn complete(&self, _model: &str, messages: &[Turn]) -> Result<String, CompletionError> {
            let last = messages.last().map(|t| t.content.clone()).unwrap_or_default();
            Ok(format!("echo: {}", last))
        }
    }

    fn message(chat_id: i64, user_id: i64, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id,
            user_id,
            text: text.to_string(),
        }
    }

    async fn wait_for_replies(transport: &FakeTransport, count: usize) {
        for _ in 0..200 {
            if transport.sent().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} replies, got {:?}", count, transport.sent());
    }

    #[tokio::test]
    async fn test_relay_replies_to_originating_chat() {
        let store = Arc::new(MemoryStore::default());
        let handler = Arc::new(MessageHandler::new(
            store.clone(),
            Arc::new(EchoClient),
            &Settings::default(),
        ));
        let transport = FakeTransport::new(vec![vec![
            message(100, 1, "hello"),
            message(200, 2, "/start"),
        ]]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = Relay::new(handler, transport.clone(), &Settings::default());
        let running = tokio::spawn(relay.run(shutdown_rx));

        wait_for_replies(&transport, 2).await;
        shutdown_tx.send(true).unwrap();
        running.await.unwrap();

        let mut sent = transport.sent();
        sent.sort();
        assert_eq!(sent[0], (100, "echo: hello".to_string()));
        assert_eq!(sent[1].0, 200);
        assert_eq!(store.get_history(1).await.len(), 2);
        assert!(store.get_history(2).await.is_empty());
    }

    #[tokio::test]
    async fn test_queued_messages_are_answered_on_shutdown() {
        let handler = Arc::new(MessageHandler::new(
            Arc::new(MemoryStore::default()),
            Arc::new(EchoClient),
            &Settings::default(),
        ));
        let transport = FakeTransport::new(Vec::new());
        let relay = Relay::new(handler, transport.clone(), &Settings::default());

        let (sender, mut receiver) = channel(4);
        sender.send(message(10, 1, "first")).await.unwrap();
        sender.send(message(20, 2, "second")).await.unwrap();
        drop(sender);

        let mut tasks = JoinSet::new();
        relay.drain_pending(&mut receiver, &mut tasks).await;
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let mut sent = transport.sent();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                (10, "echo: first".to_string()),
                (20, "echo: second".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_survives_polling_error() {
        let handler = Arc::new(MessageHandler::new(
            Arc::new(MemoryStore::default()),
            Arc::new(EchoClient),
            &Settings::default(),
        ));
        let transport = FakeTransport::new(vec![vec![message(1, 1, "again")]]);
        *transport.fail_first_poll.lock().unwrap() = true;

        tokio::time::pause();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let relay = Relay::new(handler, transport.clone(), &Settings::default());
        let running = tokio::spawn(relay.run(shutdown_rx));

        tokio::time::advance(POLL_ERROR_BACKOFF + Duration::from_secs(1)).await;
        wait_for_replies(&transport, 1).await;

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
        assert_eq!(transport.sent(), vec![(1, "echo: again".to_string())]);
    }
}
