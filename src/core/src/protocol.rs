//! Wire protocol for the realtime socket.
//!
//! Every frame is a JSON text frame `{"event": <name>, "data": <payload>}`.
//! Payload keys are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::{MessageStatus, MessageType};

/// Conversation (chat) identifier.
pub type ConversationId = String;

/// User identifier.
pub type UserId = String;

// ═══════════════════════════════════════════════════════════════════════════════
// Client Events (Client -> Server)
// ═══════════════════════════════════════════════════════════════════════════════

/// Events this client emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Start receiving a conversation's events
    JoinChat { chat_id: ConversationId },

    /// Stop receiving a conversation's events
    LeaveChat { chat_id: ConversationId },

    /// Send a message; `temp_id` is echoed back in `message_sent`
    SendMessage {
        chat_id: ConversationId,
        content: String,
        #[serde(rename = "type")]
        message_type: MessageType,
        temp_id: String,
    },

    /// This user started typing
    TypingStart { chat_id: ConversationId },

    /// This user stopped typing
    TypingStop { chat_id: ConversationId },

    /// Mark a message as read
    MessageRead { message_id: String },
}

impl ClientEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinChat { .. } => "join_chat",
            Self::LeaveChat { .. } => "leave_chat",
            Self::SendMessage { .. } => "send_message",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::MessageRead { .. } => "message_read",
        }
    }

    /// Conversation the event targets, when it names one.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::JoinChat { chat_id }
            | Self::LeaveChat { chat_id }
            | Self::SendMessage { chat_id, .. }
            | Self::TypingStart { chat_id }
            | Self::TypingStop { chat_id } => Some(chat_id),
            Self::MessageRead { .. } => None,
        }
    }

    /// Typing intents are deduplicated per conversation while queued.
    pub fn is_typing_intent(&self) -> bool {
        matches!(self, Self::TypingStart { .. } | Self::TypingStop { .. })
    }

    /// Local id of the message this event sends, if any.
    pub fn temp_id(&self) -> Option<&str> {
        match self {
            Self::SendMessage { temp_id, .. } => Some(temp_id),
            _ => None,
        }
    }

    /// Encode as a text frame.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Server Events (Server -> Client)
// ═══════════════════════════════════════════════════════════════════════════════

/// Events the server pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// A message was posted to a joined conversation
    NewMessage(WireMessage),

    /// Acknowledgement of one of our `send_message` events
    MessageSent { temp_id: String, message: WireMessage },

    /// A message reached its recipient
    MessageDelivered { message_id: String },

    /// A message was read by its recipient
    MessageRead { message_id: String },

    /// Someone started typing
    TypingStart { chat_id: ConversationId, user_id: UserId },

    /// Someone stopped typing
    TypingStop { chat_id: ConversationId, user_id: UserId },

    /// A user came online
    UserOnline { user_id: UserId },

    /// A user went offline
    UserOffline { user_id: UserId },

    /// The server refused the connection
    ConnectError {
        #[serde(default)]
        message: String,
    },
}

const SERVER_EVENT_NAMES: &[&str] = &[
    "new_message",
    "message_sent",
    "message_delivered",
    "message_read",
    "typing_start",
    "typing_stop",
    "user_online",
    "user_offline",
    "connect_error",
];

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl ServerEvent {
    /// Decode a text frame.
    ///
    /// Returns `Ok(None)` for well-formed frames naming an event this client
    /// does not handle.
    pub fn from_frame(frame: &str) -> Result<Option<Self>> {
        let raw: RawFrame = serde_json::from_str(frame)?;
        if !SERVER_EVENT_NAMES.contains(&raw.event.as_str()) {
            tracing::debug!(event = %raw.event, "Ignoring unknown server event");
            return Ok(None);
        }

        let event = serde_json::from_value(serde_json::json!({
            "event": raw.event,
            "data": raw.data,
        }))?;
        Ok(Some(event))
    }

    /// Encode as a text frame.
    pub fn to_frame(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::MessageSent { .. } => "message_sent",
            Self::MessageDelivered { .. } => "message_delivered",
            Self::MessageRead { .. } => "message_read",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::UserOnline { .. } => "user_online",
            Self::UserOffline { .. } => "user_offline",
            Self::ConnectError { .. } => "connect_error",
        }
    }
}

/// A message as the server sends it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(alias = "_id", alias = "id")]
    pub server_id: String,

    #[serde(default, alias = "chatId")]
    pub conversation_id: ConversationId,

    #[serde(default, alias = "sender")]
    pub sender_id: UserId,

    #[serde(default)]
    pub content: String,

    #[serde(rename = "type", default)]
    pub message_type: MessageType,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

impl WireMessage {
    pub fn new(
        server_id: impl Into<String>,
        conversation_id: impl Into<ConversationId>,
        sender_id: impl Into<UserId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            message_type: MessageType::Text,
            created_at: Utc::now(),
            temp_id: None,
            status: None,
        }
    }

    pub fn with_temp_id(mut self, temp_id: impl Into<String>) -> Self {
        self.temp_id = Some(temp_id.into());
        self
    }
}
