//! Scenario tests for the chat session.
//!
//! Drive a `ChatSession` over a `MockTransport` with a manual clock, pumping
//! transport signals by hand the way the runtime loop would.

use std::sync::Arc;
use std::time::Duration;

use eventconnect_core::clock::ManualClock;
use eventconnect_core::config::ClientConfig;
use eventconnect_core::events::SessionEvent;
use eventconnect_core::message::{MessageStatus, MessageType};
use eventconnect_core::protocol::{ClientEvent, ServerEvent, WireMessage};
use eventconnect_core::reconnect::{CloseReason, ConnectionState};
use eventconnect_core::session::ChatSession;
use eventconnect_core::timers::TimerKey;
use eventconnect_core::transport::{
    Credentials, MockTransport, TransportEvent, TransportFailure, TransportSignal,
};
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// Test Utilities
// ============================================================================

struct Harness {
    session: ChatSession<MockTransport>,
    transport: MockTransport,
    clock: ManualClock,
    signals: mpsc::UnboundedReceiver<TransportSignal>,
}

impl Harness {
    fn new() -> Self {
        let (tx, signals) = mpsc::unbounded_channel();
        let transport = MockTransport::new().with_signals(tx);
        let clock = ManualClock::new();
        let session = ChatSession::new(
            transport.clone(),
            &ClientConfig::default(),
            Arc::new(clock.clone()),
        )
        .with_identity("me");
        Self {
            session,
            transport,
            clock,
            signals,
        }
    }

    /// Feed every pending transport signal into the session.
    fn pump(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            self.session.handle_transport_event(signal.epoch, signal.event);
        }
    }

    fn connect(&mut self) {
        self.session.connect(Credentials::new("token", "me")).unwrap();
        self.transport.signal(TransportEvent::Opened);
        self.pump();
        assert_eq!(self.session.connection_state(), ConnectionState::Connected);
    }

    fn server(&mut self, event: ServerEvent) {
        self.transport.push(event);
        self.pump();
    }

    fn drop_connection(&mut self) {
        self.transport
            .signal(TransportEvent::Closed(CloseReason::TransportClose));
        self.pump();
    }

    fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.session.poll_timers();
        self.pump();
    }
}

fn statuses(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<MessageStatus> {
    std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            SessionEvent::MessageAdded { message } | SessionEvent::MessageUpdated { message, .. } => {
                Some(message.status)
            }
            _ => None,
        })
        .collect()
}

fn send_offline(h: &mut Harness, text: &str) -> String {
    let local_id = h
        .session
        .send_message("c1", text, MessageType::Text)
        .local_id
        .unwrap();
    assert_eq!(h.session.queue_len(), 1);
    local_id
}

fn assert_expired(h: &Harness, local_id: &str, events: &mut broadcast::Receiver<SessionEvent>) {
    assert_eq!(h.session.message(local_id).unwrap().status, MessageStatus::Failed);
    assert_eq!(h.session.queue_len(), 0);
    assert!(std::iter::from_fn(|| events.try_recv().ok()).any(|e| matches!(
        e,
        SessionEvent::EnvelopeExpired { local_id: Some(ref id), .. } if id == local_id
    )));
}

// ============================================================================
// Reconciliation
// ============================================================================

#[test]
fn test_status_progresses_through_read() {
    let mut h = Harness::new();
    h.connect();
    let mut events = h.session.subscribe();

    let local_id = h
        .session
        .send_message("c1", "hello", MessageType::Text)
        .local_id
        .unwrap();
    h.server(ServerEvent::MessageSent {
        temp_id: local_id.clone(),
        message: WireMessage::new("abc", "c1", "me", "hello"),
    });
    h.server(ServerEvent::MessageDelivered {
        message_id: "abc".into(),
    });
    h.server(ServerEvent::MessageRead {
        message_id: "abc".into(),
    });

    assert_eq!(
        statuses(&mut events),
        vec![
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
        ]
    );
    assert_eq!(h.session.message(&local_id).unwrap().status, MessageStatus::Read);
}

#[test]
fn test_delivered_before_confirmation_is_applied_after() {
    let mut h = Harness::new();
    h.connect();

    let local_id = h
        .session
        .send_message("c1", "hello", MessageType::Text)
        .local_id
        .unwrap();
    h.server(ServerEvent::MessageDelivered {
        message_id: "abc".into(),
    });
    assert_eq!(h.session.message(&local_id).unwrap().status, MessageStatus::Sending);

    h.server(ServerEvent::MessageSent {
        temp_id: local_id.clone(),
        message: WireMessage::new("abc", "c1", "me", "hello"),
    });

    let message = h.session.message(&local_id).unwrap();
    assert_eq!(message.status, MessageStatus::Delivered);
    assert_eq!(message.server_id.as_deref(), Some("abc"));
}

#[test]
fn test_echo_before_ack_does_not_duplicate() {
    let mut h = Harness::new();
    h.connect();

    let local_id = h
        .session
        .send_message("c1", "hello", MessageType::Text)
        .local_id
        .unwrap();
    h.server(ServerEvent::NewMessage(
        WireMessage::new("abc", "c1", "me", "hello").with_temp_id(local_id.clone()),
    ));
    h.server(ServerEvent::MessageSent {
        temp_id: local_id.clone(),
        message: WireMessage::new("abc", "c1", "me", "hello"),
    });

    let messages = h.session.messages("c1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sent);
}

#[test]
fn test_read_before_history_backfill_is_applied() {
    let mut h = Harness::new();
    h.connect();
    h.server(ServerEvent::MessageRead {
        message_id: "m1".into(),
    });

    let page = vec![WireMessage::new("m1", "c1", "u2", "earlier")];
    assert_eq!(h.session.merge_history("c1", 1, page).unwrap(), 1);
    assert_eq!(h.session.message("m1").unwrap().status, MessageStatus::Read);
}

// ============================================================================
// Offline Queue
// ============================================================================

#[test]
fn test_offline_typing_collapses_to_latest_intent() {
    let mut h = Harness::new();

    h.session.set_typing("c1", true);
    h.session.set_typing("c1", false);

    assert_eq!(
        h.session.queued_events(),
        vec![ClientEvent::TypingStop {
            chat_id: "c1".into()
        }]
    );
}

#[test]
fn test_offline_send_drains_and_confirms() {
    let mut h = Harness::new();

    let message = h.session.send_message("c1", "hi", MessageType::Text);
    let local_id = message.local_id.clone().unwrap();
    assert_eq!(h.session.queue_len(), 1);
    assert!(h.transport.emitted().is_empty());

    h.connect();
    assert_eq!(h.session.queue_len(), 0);
    assert_eq!(
        h.transport.emitted(),
        vec![ClientEvent::SendMessage {
            chat_id: "c1".into(),
            content: "hi".into(),
            message_type: MessageType::Text,
            temp_id: local_id.clone(),
        }]
    );

    h.server(ServerEvent::MessageSent {
        temp_id: local_id.clone(),
        message: WireMessage::new("abc", "c1", "me", "hi"),
    });
    let confirmed = h.session.message(&local_id).unwrap();
    assert_eq!(confirmed.status, MessageStatus::Sent);
    assert_eq!(confirmed.server_id.as_deref(), Some("abc"));
}

#[test]
fn test_stale_envelope_expires_and_fails_message() {
    let mut h = Harness::new();
    let mut events = h.session.subscribe();

    let local_id = h
        .session
        .send_message("c1", "old", MessageType::Text)
        .local_id
        .unwrap();
    h.clock.advance(Duration::from_secs(6 * 60));
    h.connect();

    assert!(h.transport.emitted().is_empty());
    assert_eq!(h.session.message(&local_id).unwrap().status, MessageStatus::Failed);
    assert!(std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, SessionEvent::EnvelopeExpired { .. })));
}

#[test]
fn test_queued_send_fails_once_ttl_passes_offline() {
    let mut h = Harness::new();
    let mut events = h.session.subscribe();
    let local_id = send_offline(&mut h, "never connected");

    h.advance(Duration::from_secs(299));
    assert_eq!(h.session.message(&local_id).unwrap().status, MessageStatus::Sending);

    h.advance(Duration::from_secs(1));
    assert_expired(&h, &local_id, &mut events);
    assert_eq!(h.session.next_deadline(), None);
}

#[test]
fn test_queued_send_fails_after_explicit_disconnect() {
    let mut h = Harness::new();
    h.connect();
    h.session.disconnect();
    let mut events = h.session.subscribe();
    let local_id = send_offline(&mut h, "after disconnect");

    h.advance(Duration::from_secs(300));
    assert_expired(&h, &local_id, &mut events);
    assert!(h.transport.emitted().is_empty());
}

#[test]
fn test_queued_send_fails_after_auth_rejection() {
    let mut h = Harness::new();
    h.connect();
    h.transport
        .signal(TransportEvent::Error(TransportFailure::AuthRejected {
            reason: "jwt expired".into(),
        }));
    h.pump();
    let mut events = h.session.subscribe();
    let local_id = send_offline(&mut h, "after auth failure");

    h.advance(Duration::from_secs(300));
    assert_expired(&h, &local_id, &mut events);
}

#[test]
fn test_drained_send_swaps_queue_expiry_for_send_timeout() {
    let mut h = Harness::new();
    let local_id = send_offline(&mut h, "queued");
    assert!(h.session.is_timer_scheduled(&TimerKey::QueueExpiry {
        local_id: local_id.clone()
    }));

    h.connect();
    assert!(!h.session.is_timer_scheduled(&TimerKey::QueueExpiry {
        local_id: local_id.clone()
    }));
    assert!(h
        .session
        .is_timer_scheduled(&TimerKey::SendTimeout { local_id }));
}

// ============================================================================
// Reconnection
// ============================================================================

#[test]
fn test_reconnect_gives_up_after_five_attempts() {
    let mut h = Harness::new();
    h.connect();
    h.drop_connection();
    assert_eq!(h.session.connection_state(), ConnectionState::Reconnecting);

    for delay in [1, 2, 4, 8, 16] {
        h.advance(Duration::from_secs(delay));
        assert_eq!(h.session.connection_state(), ConnectionState::Reconnecting);
        h.drop_connection();
    }

    assert_eq!(h.session.connection_state(), ConnectionState::Failed);
    assert_eq!(h.session.next_deadline(), None);

    let opens = h.transport.open_count();
    h.advance(Duration::from_secs(600));
    assert_eq!(h.transport.open_count(), opens);
    assert_eq!(h.session.connection_state(), ConnectionState::Failed);
}

#[test]
fn test_reconnect_rejoins_each_conversation_once_in_order() {
    let mut h = Harness::new();
    h.connect();
    h.session.join_conversation("a");
    h.session.join_conversation("b");
    h.session.join_conversation("c");
    h.drop_connection();
    h.transport.take_emitted();

    h.advance(Duration::from_secs(1));
    h.transport.signal(TransportEvent::Opened);
    h.pump();

    assert_eq!(h.session.connection_state(), ConnectionState::Connected);
    assert_eq!(
        h.transport.emitted(),
        vec![
            ClientEvent::JoinChat { chat_id: "a".into() },
            ClientEvent::JoinChat { chat_id: "b".into() },
            ClientEvent::JoinChat { chat_id: "c".into() },
        ]
    );
}

#[test]
fn test_join_while_offline_is_sent_once_on_connect() {
    let mut h = Harness::new();
    h.session.join_conversation("a");
    h.connect();

    assert_eq!(
        h.transport.emitted(),
        vec![ClientEvent::JoinChat { chat_id: "a".into() }]
    );
}

#[test]
fn test_signals_from_torn_down_socket_are_ignored() {
    let mut h = Harness::new();
    h.connect();
    let old_epoch = h.session.live_epoch().unwrap();

    h.session.disconnect();
    h.session
        .handle_transport_event(old_epoch, TransportEvent::Opened);
    h.session.handle_transport_event(
        old_epoch,
        TransportEvent::Inbound(ServerEvent::UserOnline {
            user_id: "u2".into(),
        }),
    );

    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert!(!h.session.is_online("u2"));
}

#[test]
fn test_initial_connect_failure_ends_disconnected_without_retry() {
    let mut h = Harness::new();
    let mut events = h.session.subscribe();

    h.session.connect(Credentials::new("token", "me")).unwrap();
    h.transport
        .signal(TransportEvent::Closed(CloseReason::TransportError));
    h.pump();

    assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(h.session.next_deadline(), None);

    let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    let transitions: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ConnectionStateChanged { previous, current } => Some((*previous, *current)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Disconnected),
        ]
    );
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::ConnectFailed {
            reason: CloseReason::TransportError
        }
    )));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, SessionEvent::ReconnectScheduled { .. })));

    let opens = h.transport.open_count();
    h.advance(Duration::from_secs(60));
    assert_eq!(h.transport.open_count(), opens);
}

#[test]
fn test_queued_send_fails_after_reconnect_gives_up() {
    let mut h = Harness::new();
    h.connect();
    h.drop_connection();
    for delay in [1, 2, 4, 8, 16] {
        h.advance(Duration::from_secs(delay));
        h.drop_connection();
    }
    assert_eq!(h.session.connection_state(), ConnectionState::Failed);

    let mut events = h.session.subscribe();
    let local_id = send_offline(&mut h, "while failed");
    h.advance(Duration::from_secs(300));
    assert_expired(&h, &local_id, &mut events);
}

// ============================================================================
// Presence
// ============================================================================

#[test]
fn test_typing_expires_after_three_seconds() {
    let mut h = Harness::new();
    h.connect();

    h.server(ServerEvent::TypingStart {
        chat_id: "c1".into(),
        user_id: "u2".into(),
    });
    assert_eq!(h.session.typing_users("c1"), vec!["u2".to_string()]);

    h.advance(Duration::from_millis(2900));
    assert_eq!(h.session.typing_users("c1"), vec!["u2".to_string()]);

    h.advance(Duration::from_millis(100));
    assert!(h.session.typing_users("c1").is_empty());
}

#[test]
fn test_repeated_typing_start_extends_expiry() {
    let mut h = Harness::new();
    h.connect();
    let start = ServerEvent::TypingStart {
        chat_id: "c1".into(),
        user_id: "u2".into(),
    };

    h.server(start.clone());
    h.advance(Duration::from_secs(2));
    h.server(start);
    h.advance(Duration::from_secs(2));
    assert_eq!(h.session.typing_users("c1"), vec!["u2".to_string()]);

    h.advance(Duration::from_secs(1));
    assert!(h.session.typing_users("c1").is_empty());
}

#[test]
fn test_user_offline_clears_their_typing() {
    let mut h = Harness::new();
    h.connect();
    h.server(ServerEvent::UserOnline {
        user_id: "u2".into(),
    });
    h.server(ServerEvent::TypingStart {
        chat_id: "c1".into(),
        user_id: "u2".into(),
    });

    h.server(ServerEvent::UserOffline {
        user_id: "u2".into(),
    });
    assert!(!h.session.is_online("u2"));
    assert!(h.session.typing_users("c1").is_empty());
}

// ============================================================================
// Send Timeout
// ============================================================================

#[test]
fn test_unconfirmed_send_fails_after_ten_seconds_without_resend() {
    let mut h = Harness::new();
    h.connect();

    let local_id = h
        .session
        .send_message("c1", "hello", MessageType::Text)
        .local_id
        .unwrap();
    assert_eq!(h.transport.emitted().len(), 1);

    h.advance(Duration::from_secs(9));
    assert_eq!(h.session.message(&local_id).unwrap().status, MessageStatus::Sending);

    h.advance(Duration::from_secs(1));
    assert_eq!(h.session.message(&local_id).unwrap().status, MessageStatus::Failed);

    h.advance(Duration::from_secs(60));
    assert_eq!(h.transport.emitted().len(), 1);
}

#[test]
fn test_send_timeout_survives_disconnect() {
    let mut h = Harness::new();
    h.connect();

    let local_id = h
        .session
        .send_message("c1", "hello", MessageType::Text)
        .local_id
        .unwrap();
    h.session.disconnect();

    h.advance(Duration::from_secs(10));
    assert_eq!(h.session.message(&local_id).unwrap().status, MessageStatus::Failed);
}

// ============================================================================
// Auth
// ============================================================================

#[test]
fn test_auth_rejection_clears_joined_set_and_never_retries() {
    let mut h = Harness::new();
    h.connect();
    h.session.join_conversation("c1");
    let mut events = h.session.subscribe();

    h.transport.signal(TransportEvent::Error(
        TransportFailure::AuthRejected {
            reason: "jwt expired".into(),
        },
    ));
    h.pump();

    assert!(std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, SessionEvent::AuthFailed { .. })));
    assert!(h.session.joined_conversations().is_empty());

    let opens = h.transport.open_count();
    h.advance(Duration::from_secs(120));
    assert_eq!(h.transport.open_count(), opens);
}
