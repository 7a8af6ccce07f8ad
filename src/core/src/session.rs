//! Chat session facade.
//!
//! [`ChatSession`] composes the transport, reconnection controller, outbound
//! queue, reconciliation store and presence tracker behind one API. It is a
//! plain state machine: it never spawns or sleeps. The owner feeds it
//! transport signals through [`ChatSession::handle_transport_event`] and calls
//! [`ChatSession::poll_timers`] once [`ChatSession::next_deadline`] passes.
//! [`crate::runtime`] does exactly that on a tokio task.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use eventconnect_core::prelude::*;
//!
//! let transport = MockTransport::new();
//! let mut session = ChatSession::new(transport.clone(), &ClientConfig::default(), Arc::new(SystemClock));
//!
//! let message = session.send_message("c1", "hi", MessageType::Text);
//! assert_eq!(message.status, MessageStatus::Sending);
//! assert_eq!(session.queue_len(), 1);
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::message::{Message, MessageDraft, MessageStatus, MessageType};
use crate::presence::PresenceTracker;
use crate::protocol::{ClientEvent, ConversationId, ServerEvent, UserId, WireMessage};
use crate::queue::{OutboundEnvelope, OutboundQueue, QueueStats};
use crate::reconnect::{
    CloseReason, ConnectionState, ReconnectController, ReconnectDecision, ReconnectMetrics,
};
use crate::store::{InsertOutcome, ReconciliationStore, StatusChange};
use crate::telemetry::metrics::MessageMetrics;
use crate::timers::{TimerKey, TimerTable};
use crate::transport::{Credentials, Transport, TransportEvent, TransportFailure};

pub struct ChatSession<T: Transport> {
    transport: T,
    clock: Arc<dyn Clock>,
    reconnect: ReconnectController,
    queue: OutboundQueue,
    store: ReconciliationStore,
    presence: PresenceTracker,
    timers: TimerTable,
    events: EventBus,
    confirm_timeout: Duration,

    credentials: Option<Credentials>,
    identity: Option<UserId>,
    /// Epoch of the socket whose signals are accepted
    live_epoch: Option<u64>,
    last_epoch: u64,
    /// Bumped by every explicit connect/disconnect; reconnect timers carry it
    generation: u64,
    /// Joined conversations in join order
    joined: Vec<ConversationId>,
}

impl<T: Transport> ChatSession<T> {
    pub fn new(transport: T, config: &ClientConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            reconnect: ReconnectController::new(config.reconnect.clone()),
            queue: OutboundQueue::new(config.queue.clone()),
            store: ReconciliationStore::new(config.messages.max_pending_updates),
            presence: PresenceTracker::new(config.presence.typing_timeout),
            timers: TimerTable::new(),
            events: EventBus::new(config.session.event_capacity),
            confirm_timeout: config.messages.confirm_timeout,
            credentials: None,
            identity: None,
            live_epoch: None,
            last_epoch: 0,
            generation: 0,
            joined: Vec::new(),
        }
    }

    /// Set the local user before the first `connect`, so offline sends carry
    /// a sender id.
    pub fn with_identity(mut self, user_id: impl Into<UserId>) -> Self {
        self.identity = Some(user_id.into());
        self
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Connection
    // ═══════════════════════════════════════════════════════════════════════════

    /// Open a socket with `credentials`. An existing socket is torn down first.
    ///
    /// Returns once the handshake is requested; `Connected` arrives later as
    /// a transport signal.
    pub fn connect(&mut self, credentials: Credentials) -> Result<()> {
        if self.reconnect.state() != ConnectionState::Disconnected {
            self.teardown();
        }

        self.generation += 1;
        self.identity = Some(credentials.user_id.clone());
        self.credentials = Some(credentials.clone());

        let previous = self.reconnect.begin_connect()?;
        self.publish_state(previous);

        if let Err(error) = self.open_socket(&credentials) {
            error.log();
            let previous = self.reconnect.teardown();
            self.publish_state(previous);
            return Err(error);
        }
        Ok(())
    }

    /// Close the socket and stop reconnecting. The joined set is kept for
    /// the next `connect`.
    pub fn disconnect(&mut self) {
        self.teardown();
        info!(joined = self.joined.len(), "Disconnected");
    }

    fn teardown(&mut self) {
        self.generation += 1;
        self.live_epoch = None;
        self.transport.close();
        self.timers.cancel_where(|key| {
            matches!(key, TimerKey::Reconnect { .. } | TimerKey::TypingExpiry { .. })
        });
        for conversation_id in self.presence.clear_typing() {
            self.events.publish(SessionEvent::TypingChanged {
                conversation_id,
                users: Vec::new(),
            });
        }

        let previous = self.reconnect.teardown();
        self.publish_state(previous);
    }

    fn open_socket(&mut self, credentials: &Credentials) -> Result<()> {
        self.last_epoch += 1;
        let epoch = self.last_epoch;
        self.live_epoch = Some(epoch);
        debug!(epoch, user_id = %credentials.user_id, "Opening transport");
        self.transport.open(credentials, epoch)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Conversations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Join a conversation. While offline the join is deferred to the next
    /// `Connected`, which rejoins every conversation in the joined set.
    pub fn join_conversation(&mut self, conversation_id: &str) {
        if self.joined.iter().any(|c| c == conversation_id) {
            return;
        }
        self.joined.push(conversation_id.to_string());

        if self.is_connected() {
            let event = ClientEvent::JoinChat {
                chat_id: conversation_id.to_string(),
            };
            if let Err(error) = self.transport.emit(&event) {
                error.log();
            }
        }
    }

    pub fn leave_conversation(&mut self, conversation_id: &str) {
        let before = self.joined.len();
        self.joined.retain(|c| c != conversation_id);
        if self.joined.len() == before {
            return;
        }

        if self.is_connected() {
            let event = ClientEvent::LeaveChat {
                chat_id: conversation_id.to_string(),
            };
            if let Err(error) = self.transport.emit(&event) {
                error.log();
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Outbound
    // ═══════════════════════════════════════════════════════════════════════════

    /// Send a message. Returns the optimistic `Sending` message at once.
    pub fn send_message(
        &mut self,
        conversation_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Message {
        let draft = MessageDraft::new(
            conversation_id,
            self.identity.clone().unwrap_or_default(),
            content,
        )
        .with_type(message_type);
        let message = self.store.create_optimistic(draft, self.clock.wall());
        MessageMetrics::sent();

        self.events.publish(SessionEvent::MessageAdded {
            message: message.clone(),
        });

        let temp_id = message.local_id.clone().unwrap_or_default();
        self.dispatch(ClientEvent::SendMessage {
            chat_id: conversation_id.to_string(),
            content: content.to_string(),
            message_type,
            temp_id,
        });
        message
    }

    pub fn set_typing(&mut self, conversation_id: &str, is_typing: bool) {
        let chat_id = conversation_id.to_string();
        self.dispatch(if is_typing {
            ClientEvent::TypingStart { chat_id }
        } else {
            ClientEvent::TypingStop { chat_id }
        });
    }

    /// Tell the server a message was read. Local ids are translated to the
    /// server id when one is known.
    pub fn mark_read(&mut self, message_id: &str) {
        let message_id = self
            .store
            .server_id_for(message_id)
            .unwrap_or(message_id)
            .to_string();
        self.dispatch(ClientEvent::MessageRead { message_id });
    }

    /// Emit now when connected, otherwise queue.
    fn dispatch(&mut self, event: ClientEvent) {
        if self.is_connected() {
            match self.transport.emit(&event) {
                Ok(()) => {
                    self.on_handed_off(&event);
                    return;
                }
                Err(error) => error.log(),
            }
        }

        let now = self.clock.now();
        let envelope = OutboundEnvelope::new(event, now);
        if let Some(local_id) = envelope.local_id.clone() {
            self.timers
                .schedule(TimerKey::QueueExpiry { local_id }, now + self.queue.ttl());
        }

        let report = self.queue.enqueue(envelope);
        if let Some(evicted) = report.evicted {
            self.on_envelope_dropped(evicted);
        }
    }

    fn on_handed_off(&mut self, event: &ClientEvent) {
        if let Some(local_id) = event.temp_id() {
            self.timers.cancel(&TimerKey::QueueExpiry {
                local_id: local_id.to_string(),
            });
            self.timers.schedule(
                TimerKey::SendTimeout {
                    local_id: local_id.to_string(),
                },
                self.clock.now() + self.confirm_timeout,
            );
        }
    }

    fn on_envelope_dropped(&mut self, envelope: OutboundEnvelope) {
        self.events.publish(SessionEvent::EnvelopeExpired {
            event_name: envelope.event.name().to_string(),
            local_id: envelope.local_id.clone(),
        });
        if let Some(local_id) = &envelope.local_id {
            self.timers.cancel(&TimerKey::QueueExpiry {
                local_id: local_id.clone(),
            });
            self.fail_message(local_id, "queue_expiry");
        }
    }

    fn fail_message(&mut self, local_id: &str, reason: &'static str) {
        if let Some(change) = self.store.mark_failed(local_id) {
            MessageMetrics::failed(reason);
            warn!(local_id = %local_id, reason, "Message failed");
            self.publish_change(change);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Transport signals
    // ═══════════════════════════════════════════════════════════════════════════

    /// Apply a transport signal. Signals from any epoch but the live one are
    /// ignored.
    pub fn handle_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        if self.live_epoch != Some(epoch) {
            debug!(epoch, live = ?self.live_epoch, "Ignoring signal from stale socket");
            return;
        }

        match event {
            TransportEvent::Opened => self.on_opened(),
            TransportEvent::Closed(reason) => self.on_connection_lost(reason),
            TransportEvent::Error(TransportFailure::Network { message }) => {
                ChatError::transport(message).log();
                self.on_connection_lost(CloseReason::TransportError);
            }
            TransportEvent::Error(TransportFailure::AuthRejected { reason }) => {
                self.on_auth_rejected(reason)
            }
            TransportEvent::Inbound(event) => self.on_server_event(event),
        }
    }

    fn on_opened(&mut self) {
        let previous = match self.reconnect.on_opened() {
            Ok(previous) => previous,
            Err(_) => return,
        };
        self.publish_state(previous);

        for conversation_id in &self.joined {
            let event = ClientEvent::JoinChat {
                chat_id: conversation_id.clone(),
            };
            if let Err(error) = self.transport.emit(&event) {
                error.log();
            }
        }

        let now = self.clock.now();
        let transport = &mut self.transport;
        let report = self.queue.drain(now, |event| transport.emit(event));

        for envelope in &report.sent {
            self.on_handed_off(&envelope.event);
        }
        for envelope in report.expired {
            self.on_envelope_dropped(envelope);
        }
        if let Some(error) = report.halted {
            warn!(remaining = self.queue.len(), "Drain stopped early");
            error.log();
        }

        info!(
            rejoined = self.joined.len(),
            drained = report.sent.len(),
            "Session connected"
        );
    }

    fn on_connection_lost(&mut self, reason: CloseReason) {
        self.live_epoch = None;
        let previous = self.reconnect.state();
        let decision = self.reconnect.on_closed(reason);
        self.publish_state(previous);
        self.apply_decision(decision);

        if previous == ConnectionState::Connecting {
            self.events.publish(SessionEvent::ConnectFailed { reason });
        }
    }

    fn apply_decision(&mut self, decision: ReconnectDecision) {
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                self.timers.schedule(
                    TimerKey::Reconnect {
                        generation: self.generation,
                    },
                    self.clock.now() + delay,
                );
                self.events.publish(SessionEvent::ReconnectScheduled {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            ReconnectDecision::GiveUp { .. } | ReconnectDecision::Stay => {
                self.timers
                    .cancel_where(|key| matches!(key, TimerKey::Reconnect { .. }));
            }
        }
    }

    fn on_auth_rejected(&mut self, reason: String) {
        ChatError::auth(reason.clone()).log();

        self.generation += 1;
        self.live_epoch = None;
        self.transport.close();
        self.timers
            .cancel_where(|key| matches!(key, TimerKey::Reconnect { .. }));

        let previous = self.reconnect.on_auth_rejected();
        self.publish_state(previous);

        self.joined.clear();
        self.credentials = None;
        self.events.publish(SessionEvent::AuthFailed { reason });
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        let now = self.clock.now();

        match event {
            ServerEvent::NewMessage(wire) => match self.store.insert_remote(&wire) {
                Ok(InsertOutcome::Inserted(message)) => {
                    self.events.publish(SessionEvent::MessageAdded { message });
                }
                Ok(InsertOutcome::Reconciled(changes)) => self.on_confirmed(changes),
                Ok(InsertOutcome::Duplicate) => {
                    debug!(server_id = %wire.server_id, "Duplicate message ignored");
                }
                Err(error) => error.log(),
            },

            ServerEvent::MessageSent { temp_id, message } => {
                self.confirm(&temp_id, &message);
            }

            ServerEvent::MessageDelivered { message_id } => {
                self.apply_status(&message_id, MessageStatus::Delivered);
            }

            ServerEvent::MessageRead { message_id } => {
                self.apply_status(&message_id, MessageStatus::Read);
            }

            ServerEvent::TypingStart { chat_id, user_id } => {
                if self.is_self(&user_id) {
                    return;
                }
                let outcome = self.presence.set_typing(&chat_id, &user_id, true, now);
                if let Some(expires_at) = outcome.expires_at {
                    self.timers.schedule(
                        TimerKey::TypingExpiry {
                            conversation_id: chat_id.clone(),
                            user_id,
                        },
                        expires_at,
                    );
                }
                if outcome.membership_changed {
                    self.publish_typing(chat_id);
                }
            }

            ServerEvent::TypingStop { chat_id, user_id } => {
                if self.is_self(&user_id) {
                    return;
                }
                let outcome = self.presence.set_typing(&chat_id, &user_id, false, now);
                self.timers.cancel(&TimerKey::TypingExpiry {
                    conversation_id: chat_id.clone(),
                    user_id,
                });
                if outcome.membership_changed {
                    self.publish_typing(chat_id);
                }
            }

            ServerEvent::UserOnline { user_id } => self.set_presence(user_id, true),
            ServerEvent::UserOffline { user_id } => self.set_presence(user_id, false),

            ServerEvent::ConnectError { message } => {
                warn!(reason = %message, "Server reported a connection error");
            }
        }
    }

    /// Record a server acknowledgement.
    pub fn confirm(&mut self, local_id: &str, server: &WireMessage) {
        match self.store.confirm_sent(local_id, server) {
            Ok(changes) => self.on_confirmed(changes),
            Err(error) => error.log(),
        }
    }

    fn on_confirmed(&mut self, changes: Vec<StatusChange>) {
        let mut changes = changes.into_iter();
        let Some(first) = changes.next() else {
            return;
        };

        if let Some(local_id) = first.message.local_id.clone() {
            let key = TimerKey::SendTimeout { local_id };
            let latency = self
                .timers
                .deadline(&key)
                .and_then(|deadline| deadline.checked_sub(self.confirm_timeout))
                .map(|handed_off| self.clock.now().saturating_duration_since(handed_off));
            self.timers.cancel(&key);
            MessageMetrics::confirmed(latency);
        }

        self.publish_change(first);
        for change in changes {
            MessageMetrics::status_update(change.message.status);
            self.publish_change(change);
        }
    }

    fn apply_status(&mut self, id: &str, status: MessageStatus) {
        if let Some(change) = self.store.apply_status_update(id, status) {
            MessageMetrics::status_update(status);
            self.publish_change(change);
        }
    }

    fn set_presence(&mut self, user_id: UserId, online: bool) {
        let Some(cleared) = self.presence.set_online(&user_id, online) else {
            return;
        };
        for conversation_id in cleared {
            self.timers.cancel(&TimerKey::TypingExpiry {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
            });
            self.publish_typing(conversation_id);
        }
        self.events
            .publish(SessionEvent::PresenceChanged { user_id, online });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════════

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Fire every timer that is due.
    pub fn poll_timers(&mut self) {
        let now = self.clock.now();

        for key in self.timers.pop_expired(now) {
            match key {
                TimerKey::Reconnect { generation } => {
                    if generation == self.generation {
                        self.retry_connect();
                    } else {
                        debug!(generation, current = self.generation, "Discarding stale reconnect timer");
                    }
                }
                TimerKey::SendTimeout { local_id } => {
                    if self.store.get(&local_id).map(|m| m.status) == Some(MessageStatus::Sending) {
                        ChatError::send_timeout(&local_id, self.confirm_timeout).log();
                        self.fail_message(&local_id, "timeout");
                    }
                }
                TimerKey::QueueExpiry { local_id } => {
                    if let Some(envelope) = self.queue.expire_message(&local_id, now) {
                        self.on_envelope_dropped(envelope);
                    }
                }
                TimerKey::TypingExpiry {
                    conversation_id,
                    user_id,
                } => {
                    if self.presence.expire(&conversation_id, &user_id, now) {
                        self.publish_typing(conversation_id);
                    }
                }
            }
        }
    }

    fn retry_connect(&mut self) {
        if self.reconnect.begin_retry().is_none() {
            return;
        }
        let Some(credentials) = self.credentials.clone() else {
            return;
        };

        if let Err(error) = self.open_socket(&credentials) {
            error.log();
            self.on_connection_lost(CloseReason::TransportError);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // History
    // ═══════════════════════════════════════════════════════════════════════════

    /// Merge a page of REST history into a conversation.
    pub fn merge_history(
        &mut self,
        conversation_id: &str,
        page: u32,
        messages: Vec<WireMessage>,
    ) -> Result<usize> {
        let inserted = self.store.merge_history(conversation_id, messages)?;
        self.events.publish(SessionEvent::HistoryLoaded {
            conversation_id: conversation_id.to_string(),
            page,
            inserted,
        });
        Ok(inserted)
    }

    /// Restore cached messages. Reported as history page 0.
    pub fn hydrate(&mut self, conversation_id: &str, cached: Vec<Message>) -> usize {
        let inserted = self.store.hydrate(conversation_id, cached);
        if inserted > 0 {
            self.events.publish(SessionEvent::HistoryLoaded {
                conversation_id: conversation_id.to_string(),
                page: 0,
                inserted,
            });
        }
        inserted
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.sender()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.reconnect.state()
    }

    pub fn reconnect_metrics(&self) -> ReconnectMetrics {
        self.reconnect.metrics()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.store.messages(conversation_id)
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.store.get(id)
    }

    pub fn typing_users(&self, conversation_id: &str) -> Vec<UserId> {
        self.presence.typing_users(conversation_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.presence.online_users()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.is_online(user_id)
    }

    pub fn joined_conversations(&self) -> &[ConversationId] {
        &self.joined
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_events(&self) -> Vec<ClientEvent> {
        self.queue.iter().map(|e| e.event.clone()).collect()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Epoch of the socket currently accepted, if any.
    pub fn live_epoch(&self) -> Option<u64> {
        self.live_epoch
    }

    pub fn is_timer_scheduled(&self, key: &TimerKey) -> bool {
        self.timers.is_scheduled(key)
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ─────────────────────────────────────────────────────────────────────────

    fn is_connected(&self) -> bool {
        self.reconnect.state() == ConnectionState::Connected
    }

    fn is_self(&self, user_id: &str) -> bool {
        self.identity.as_deref() == Some(user_id)
    }

    fn publish_state(&self, previous: ConnectionState) {
        let current = self.reconnect.state();
        if previous != current {
            self.events
                .publish(SessionEvent::ConnectionStateChanged { previous, current });
        }
    }

    fn publish_change(&self, change: StatusChange) {
        self.events.publish(SessionEvent::MessageUpdated {
            message: change.message,
            previous_status: change.previous,
        });
    }

    fn publish_typing(&self, conversation_id: ConversationId) {
        let users = self.presence.typing_users(&conversation_id);
        self.events
            .publish(SessionEvent::TypingChanged { conversation_id, users });
    }
}
