//! Session runtime.
//!
//! One tokio task owns the [`ChatSession`] and is its only mutator. Commands
//! from [`ChatClient`] handles, transport signals, finished background work
//! (cache loads, history fetches) and the earliest timer deadline are
//! serialized through a single `select!` loop.
//!
//! Conversations whose messages change are written back to the
//! [`MessageCache`] once `cache.flush_interval` passes without a flush. A
//! single writer task performs the writes in order.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use eventconnect_core::prelude::*;
//!
//! # async fn run() -> eventconnect_core::error::Result<()> {
//! let config = ClientConfig::default();
//! let ws_url = config.server.ws_url.clone();
//! let connect_timeout = config.server.connect_timeout;
//!
//! let client = ChatClientBuilder::new(config)
//!     .with_cache(Arc::new(InMemoryMessageCache::default()))
//!     .spawn(move |signals| WebSocketTransport::new(ws_url, connect_timeout, signals));
//!
//! client.connect(Credentials::new("token", "user-1")).await?;
//! client.join("general").await?;
//! client.send_message("general", "hello", MessageType::Text).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{InMemoryMessageCache, MessageCache};
use crate::clock::SystemClock;
use crate::config::ClientConfig;
use crate::error::{ChatError, ErrorCode, Result};
use crate::events::SessionEvent;
use crate::history::HistoryClient;
use crate::message::{Message, MessageType};
use crate::protocol::{ConversationId, UserId, WireMessage};
use crate::reconnect::ConnectionState;
use crate::session::ChatSession;
use crate::transport::{Credentials, Transport, TransportSignal};

// ═══════════════════════════════════════════════════════════════════════════════
// Commands
// ═══════════════════════════════════════════════════════════════════════════════

enum Command {
    Connect {
        credentials: Credentials,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Join {
        conversation_id: ConversationId,
        reply: oneshot::Sender<()>,
    },
    Leave {
        conversation_id: ConversationId,
        reply: oneshot::Sender<()>,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        message_type: MessageType,
        reply: oneshot::Sender<Message>,
    },
    SetTyping {
        conversation_id: ConversationId,
        is_typing: bool,
        reply: oneshot::Sender<()>,
    },
    MarkRead {
        message_id: String,
        reply: oneshot::Sender<()>,
    },
    Messages {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Vec<Message>>,
    },
    TypingUsers {
        conversation_id: ConversationId,
        reply: oneshot::Sender<Vec<UserId>>,
    },
    ConnectionState {
        reply: oneshot::Sender<ConnectionState>,
    },
    LoadHistory {
        conversation_id: ConversationId,
        page: u32,
        reply: oneshot::Sender<Result<usize>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Background work finished off the loop.
enum Completion {
    CacheLoaded {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    HistoryFetched {
        conversation_id: ConversationId,
        page: u32,
        result: Result<Vec<WireMessage>>,
        reply: oneshot::Sender<Result<usize>>,
    },
}

/// A conversation snapshot for the cache writer.
struct CacheWrite {
    conversation_id: ConversationId,
    messages: Vec<Message>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct ChatClient {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChatClient {
    /// Spawn a session with the given collaborators.
    pub fn spawn<T, F>(
        config: ClientConfig,
        make_transport: F,
        history: Option<Arc<dyn HistoryClient>>,
        cache: Arc<dyn MessageCache>,
    ) -> Self
    where
        T: Transport + 'static,
        F: FnOnce(mpsc::UnboundedSender<TransportSignal>) -> T,
    {
        let mut builder = ChatClientBuilder::new(config).with_cache(cache);
        if let Some(history) = history {
            builder = builder.with_history(history);
        }
        builder.spawn(make_transport)
    }

    /// Open the socket. Resolves once the handshake is requested;
    /// `Connected` arrives as a [`SessionEvent`].
    pub async fn connect(&self, credentials: Credentials) -> Result<()> {
        self.request(|reply| Command::Connect { credentials, reply })
            .await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Join a conversation and restore its cached messages.
    pub async fn join(&self, conversation_id: impl Into<ConversationId>) -> Result<()> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::Join {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn leave(&self, conversation_id: impl Into<ConversationId>) -> Result<()> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::Leave {
            conversation_id,
            reply,
        })
        .await
    }

    /// Send a message. Resolves with the optimistic `Sending` message;
    /// confirmation arrives as a `MessageUpdated` event.
    pub async fn send_message(
        &self,
        conversation_id: impl Into<ConversationId>,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Result<Message> {
        let conversation_id = conversation_id.into();
        let content = content.into();
        self.request(|reply| Command::SendMessage {
            conversation_id,
            content,
            message_type,
            reply,
        })
        .await
    }

    pub async fn set_typing(
        &self,
        conversation_id: impl Into<ConversationId>,
        is_typing: bool,
    ) -> Result<()> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::SetTyping {
            conversation_id,
            is_typing,
            reply,
        })
        .await
    }

    pub async fn mark_read(&self, message_id: impl Into<String>) -> Result<()> {
        let message_id = message_id.into();
        self.request(|reply| Command::MarkRead { message_id, reply })
            .await
    }

    pub async fn messages(&self, conversation_id: impl Into<ConversationId>) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::Messages {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn typing_users(
        &self,
        conversation_id: impl Into<ConversationId>,
    ) -> Result<Vec<UserId>> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::TypingUsers {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        self.request(|reply| Command::ConnectionState { reply }).await
    }

    /// Fetch a page of REST history, merge it and persist the conversation
    /// to the cache. Returns the number of messages inserted.
    pub async fn load_history(
        &self,
        conversation_id: impl Into<ConversationId>,
        page: u32,
    ) -> Result<usize> {
        let conversation_id = conversation_id.into();
        self.request(|reply| Command::LoadHistory {
            conversation_id,
            page,
            reply,
        })
        .await?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Disconnect, flush joined conversations to the cache and stop the task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ChatError::session_closed())?;
        rx.await.map_err(|_| ChatError::session_closed())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ChatClientBuilder {
    config: ClientConfig,
    history: Option<Arc<dyn HistoryClient>>,
    cache: Option<Arc<dyn MessageCache>>,
}

impl ChatClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            history: None,
            cache: None,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryClient>) -> Self {
        self.history = Some(history);
        self
    }

    /// Defaults to an in-memory cache sized from config.
    pub fn with_cache(mut self, cache: Arc<dyn MessageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Start the runtime task. `make_transport` receives the channel its
    /// signals must be sent on.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn<T, F>(self, make_transport: F) -> ChatClient
    where
        T: Transport + 'static,
        F: FnOnce(mpsc::UnboundedSender<TransportSignal>) -> T,
    {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(self.config.session.command_capacity);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let transport = make_transport(signal_tx);
        let session = ChatSession::new(transport, &self.config, Arc::new(SystemClock));
        let events = session.event_sender();
        let changes = session.subscribe();

        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(InMemoryMessageCache::new(
                self.config.cache.max_messages_per_conversation,
            ))
        });
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let cache_writer = tokio::spawn(write_cache(Arc::clone(&cache), write_rx));

        let runtime = SessionRuntime {
            session,
            history: self.history,
            cache,
            completions: completion_tx,
            changes,
            dirty: HashSet::new(),
            flush_at: None,
            flush_interval: self.config.cache.flush_interval,
            cache_writes: Some(write_tx),
            cache_writer: Some(cache_writer),
        };
        tokio::spawn(runtime.run(command_rx, signal_rx, completion_rx));

        ChatClient {
            commands: command_tx,
            events,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event Loop
// ═══════════════════════════════════════════════════════════════════════════════

struct SessionRuntime<T: Transport> {
    session: ChatSession<T>,
    history: Option<Arc<dyn HistoryClient>>,
    cache: Arc<dyn MessageCache>,
    completions: mpsc::UnboundedSender<Completion>,
    /// The runtime's own subscription, used to spot changed conversations
    changes: broadcast::Receiver<SessionEvent>,
    dirty: HashSet<ConversationId>,
    flush_at: Option<Instant>,
    flush_interval: Duration,
    cache_writes: Option<mpsc::UnboundedSender<CacheWrite>>,
    cache_writer: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> SessionRuntime<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::UnboundedReceiver<TransportSignal>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        info!("Session runtime started");

        loop {
            let deadline = self.session.next_deadline();
            let flush_at = self.flush_at;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All client handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(signal) = signals.recv() => {
                    self.session.handle_transport_event(signal.epoch, signal.event);
                }
                Some(completion) = completions.recv() => self.handle_completion(completion),
                _ = sleep_until(deadline) => self.session.poll_timers(),
                _ = sleep_until(flush_at) => self.flush_cache(),
            }

            self.track_changes();
        }

        info!("Session runtime stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { credentials, reply } => {
                let _ = reply.send(self.session.connect(credentials));
            }
            Command::Disconnect { reply } => {
                self.session.disconnect();
                let _ = reply.send(());
            }
            Command::Join {
                conversation_id,
                reply,
            } => {
                self.session.join_conversation(&conversation_id);
                self.spawn_cache_load(conversation_id);
                let _ = reply.send(());
            }
            Command::Leave {
                conversation_id,
                reply,
            } => {
                self.session.leave_conversation(&conversation_id);
                self.track_changes();
                self.dirty.remove(&conversation_id);
                self.spawn_cache_store(conversation_id);
                let _ = reply.send(());
            }
            Command::SendMessage {
                conversation_id,
                content,
                message_type,
                reply,
            } => {
                let message = self
                    .session
                    .send_message(&conversation_id, &content, message_type);
                let _ = reply.send(message);
            }
            Command::SetTyping {
                conversation_id,
                is_typing,
                reply,
            } => {
                self.session.set_typing(&conversation_id, is_typing);
                let _ = reply.send(());
            }
            Command::MarkRead { message_id, reply } => {
                self.session.mark_read(&message_id);
                let _ = reply.send(());
            }
            Command::Messages {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.session.messages(&conversation_id));
            }
            Command::TypingUsers {
                conversation_id,
                reply,
            } => {
                let _ = reply.send(self.session.typing_users(&conversation_id));
            }
            Command::ConnectionState { reply } => {
                let _ = reply.send(self.session.connection_state());
            }
            Command::LoadHistory {
                conversation_id,
                page,
                reply,
            } => self.spawn_history_fetch(conversation_id, page, reply),
            Command::Shutdown { .. } => {}
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::CacheLoaded {
                conversation_id,
                messages,
            } => {
                let restored = self.session.hydrate(&conversation_id, messages);
                debug!(conversation_id = %conversation_id, restored, "Hydrated from cache");
            }
            Completion::HistoryFetched {
                conversation_id,
                page,
                result,
                reply,
            } => {
                let merged = result.and_then(|messages| {
                    self.session
                        .merge_history(&conversation_id, page, messages)
                });
                match &merged {
                    Ok(inserted) => {
                        debug!(conversation_id = %conversation_id, page, inserted, "History merged")
                    }
                    Err(error) => error.log(),
                }
                let _ = reply.send(merged);
            }
        }
    }

    fn spawn_cache_load(&self, conversation_id: ConversationId) {
        let cache = Arc::clone(&self.cache);
        let completions = self.completions.clone();
        tokio::spawn(async move {
            match cache.load(&conversation_id).await {
                Ok(messages) if !messages.is_empty() => {
                    let _ = completions.send(Completion::CacheLoaded {
                        conversation_id,
                        messages,
                    });
                }
                Ok(_) => {}
                Err(error) => error.log(),
            }
        });
    }

    /// Mark conversations whose messages changed since the last call.
    fn track_changes(&mut self) {
        loop {
            match self.changes.try_recv() {
                Ok(SessionEvent::MessageAdded { message })
                | Ok(SessionEvent::MessageUpdated { message, .. }) => {
                    self.mark_dirty(message.conversation_id)
                }
                Ok(SessionEvent::HistoryLoaded {
                    conversation_id,
                    page,
                    ..
                }) if page > 0 => self.mark_dirty(conversation_id),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    debug!(skipped, "Change tracking lagged, flushing every joined conversation");
                    let joined = self.session.joined_conversations().to_vec();
                    for conversation_id in joined {
                        self.mark_dirty(conversation_id);
                    }
                }
                Err(_) => break,
            }
        }
    }

    fn mark_dirty(&mut self, conversation_id: ConversationId) {
        self.dirty.insert(conversation_id);
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.flush_interval);
        }
    }

    fn flush_cache(&mut self) {
        self.flush_at = None;
        for conversation_id in std::mem::take(&mut self.dirty) {
            self.spawn_cache_store(conversation_id);
        }
    }

    fn spawn_cache_store(&self, conversation_id: ConversationId) {
        let Some(writes) = &self.cache_writes else {
            return;
        };
        let messages = self.session.messages(&conversation_id);
        if messages.is_empty() {
            return;
        }
        let _ = writes.send(CacheWrite {
            conversation_id,
            messages,
        });
    }

    fn spawn_history_fetch(
        &self,
        conversation_id: ConversationId,
        page: u32,
        reply: oneshot::Sender<Result<usize>>,
    ) {
        let Some(history) = self.history.clone() else {
            let _ = reply.send(Err(ChatError::new(
                ErrorCode::HistoryFetchFailed,
                "No history client configured",
            )));
            return;
        };

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = history.fetch_messages(&conversation_id, page).await;
            let _ = completions.send(Completion::HistoryFetched {
                conversation_id,
                page,
                result,
                reply,
            });
        });
    }

    async fn shutdown(&mut self) {
        self.session.disconnect();
        self.track_changes();

        let joined = self.session.joined_conversations().to_vec();
        self.dirty.extend(joined);
        self.flush_cache();

        self.cache_writes = None;
        if let Some(writer) = self.cache_writer.take() {
            if let Err(error) = writer.await {
                warn!(error = %error, "Cache writer stopped abnormally");
            }
        }
    }
}

/// Apply cache writes one at a time, in the order they were queued.
async fn write_cache(cache: Arc<dyn MessageCache>, mut writes: mpsc::UnboundedReceiver<CacheWrite>) {
    while let Some(write) = writes.recv().await {
        if let Err(error) = cache.store(&write.conversation_id, &write.messages).await {
            warn!(conversation_id = %write.conversation_id, "Failed to write conversation cache");
            error.log();
        } else {
            debug!(
                conversation_id = %write.conversation_id,
                count = write.messages.len(),
                "Conversation cached"
            );
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageStatus;
    use crate::protocol::ServerEvent;
    use crate::transport::MockTransport;
    use std::time::Duration;

    async fn next_matching<F>(events: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_and_send_through_handle() {
        let mock = MockTransport::new().with_auto_open();
        let handle = mock.clone();
        let client = ChatClientBuilder::new(ClientConfig::default())
            .spawn(move |signals| mock.with_signals(signals));
        let mut events = client.subscribe();

        client.connect(Credentials::new("t", "me")).await.unwrap();
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::ConnectionStateChanged { current: ConnectionState::Connected, .. })
        })
        .await;

        let message = client.send_message("c1", "hi", MessageType::Text).await.unwrap();
        assert_eq!(message.status, MessageStatus::Sending);
        assert_eq!(handle.emitted().len(), 1);

        handle.push(ServerEvent::MessageSent {
            temp_id: message.local_id.clone().unwrap(),
            message: WireMessage::new("abc", "c1", "me", "hi"),
        });
        next_matching(&mut events, |e| matches!(e, SessionEvent::MessageUpdated { .. })).await;

        let messages = client.messages("c1").await.unwrap();
        assert_eq!(messages[0].status, MessageStatus::Sent);
        assert_eq!(messages[0].server_id.as_deref(), Some("abc"));

        client.shutdown().await.unwrap();
        assert!(client.connection_state().await.is_err());
    }

    #[tokio::test]
    async fn test_join_hydrates_from_cache() {
        let cache = Arc::new(InMemoryMessageCache::default());
        let cached = Message::from_wire(&WireMessage::new("m1", "c1", "u2", "cached"), "c1");
        cache.store("c1", &[cached]).await.unwrap();

        let client = ChatClientBuilder::new(ClientConfig::default())
            .with_cache(cache)
            .spawn(|signals| MockTransport::new().with_signals(signals));
        let mut events = client.subscribe();

        client.join("c1").await.unwrap();
        next_matching(&mut events, |e| matches!(e, SessionEvent::HistoryLoaded { page: 0, .. })).await;

        let messages = client.messages("c1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "cached");
    }

    #[tokio::test]
    async fn test_load_history_without_client_fails() {
        let client = ChatClientBuilder::new(ClientConfig::default())
            .spawn(|signals| MockTransport::new().with_signals(signals));

        let err = client.load_history("c1", 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::HistoryFetchFailed);
    }
}
