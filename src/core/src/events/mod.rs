//! Session events delivered to subscribers.
//!
//! One typed enum fans out over a `tokio::sync::broadcast` channel. A
//! subscriber that falls behind loses the oldest events and sees
//! `RecvError::Lagged`; the session itself never blocks on subscribers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

use crate::message::{Message, MessageStatus};
use crate::protocol::{ConversationId, UserId};
use crate::reconnect::{CloseReason, ConnectionState};

/// Something observable changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },

    /// A message appeared in a conversation (optimistic or remote)
    MessageAdded { message: Message },

    /// A message's status or server id changed
    MessageUpdated {
        message: Message,
        previous_status: MessageStatus,
    },

    /// A queued event aged out before the connection returned
    EnvelopeExpired {
        event_name: String,
        local_id: Option<String>,
    },

    HistoryLoaded {
        conversation_id: ConversationId,
        page: u32,
        inserted: usize,
    },

    /// The set of users typing in a conversation changed
    TypingChanged {
        conversation_id: ConversationId,
        users: Vec<UserId>,
    },

    PresenceChanged { user_id: UserId, online: bool },

    /// The server rejected our credentials; the session stays disconnected
    AuthFailed { reason: String },

    /// The first handshake never reached `Connected`; no retry is scheduled
    ConnectFailed { reason: CloseReason },

    ReconnectScheduled { attempt: u32, delay_ms: u64 },
}

impl SessionEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
            Self::MessageAdded { .. } => "message_added",
            Self::MessageUpdated { .. } => "message_updated",
            Self::EnvelopeExpired { .. } => "envelope_expired",
            Self::HistoryLoaded { .. } => "history_loaded",
            Self::TypingChanged { .. } => "typing_changed",
            Self::PresenceChanged { .. } => "presence_changed",
            Self::AuthFailed { .. } => "auth_failed",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::ReconnectScheduled { .. } => "reconnect_scheduled",
        }
    }
}

/// Event bus statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventBusStats {
    pub published: u64,
    /// Events published while nobody was subscribed
    pub undelivered: u64,
    pub subscribers: usize,
}

/// Broadcast fan-out of [`SessionEvent`]s.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
    published: AtomicU64,
    undelivered: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: SessionEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(kind = event.kind(), "Publishing session event");
        if self.sender.send(event).is_err() {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// A sender handle, for subscribing from outside the session task.
    pub fn sender(&self) -> broadcast::Sender<SessionEvent> {
        self.sender.clone()
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.published.load(Ordering::Relaxed),
            undelivered: self.undelivered.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(SessionEvent::PresenceChanged {
            user_id: "u2".into(),
            online: true,
        });

        assert_eq!(first.try_recv().unwrap().kind(), "presence_changed");
        assert_eq!(second.try_recv().unwrap().kind(), "presence_changed");
        assert_eq!(bus.stats().subscribers, 2);
    }

    #[test]
    fn test_publish_without_subscribers_is_counted() {
        let bus = EventBus::new(8);
        bus.publish(SessionEvent::AuthFailed {
            reason: "expired".into(),
        });

        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.undelivered, 1);
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = SessionEvent::ReconnectScheduled {
            attempt: 2,
            delay_ms: 2000,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "reconnect_scheduled");
        assert_eq!(value["delay_ms"], 2000);
    }
}
