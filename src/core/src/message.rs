//! Chat message model and delivery status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{ConversationId, UserId, WireMessage};

// ═══════════════════════════════════════════════════════════════════════════════
// Message Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Delivery status of a message.
///
/// Progresses `Sending → Sent → Delivered → Read`. `Failed` is only reachable
/// from `Sending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Optimistically inserted, not yet acknowledged
    Sending,
    /// Acknowledged by the server
    Sent,
    /// Reached the recipient's device
    Delivered,
    /// Seen by the recipient
    Read,
    /// Not acknowledged in time
    Failed,
}

impl MessageStatus {
    /// Position along the delivery path.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Sending | Self::Failed => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    /// Whether moving from `self` to `next` is a forward step.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (Self::Sending, Self::Failed) => true,
            (_, Self::Failed) | (Self::Failed, _) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Whether the server has seen this message.
    pub const fn is_confirmed(self) -> bool {
        self.rank() > 0
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Message Type
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of content a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Video,
    Audio,
    File,
    Location,
    System,
    /// Any type this client does not know about
    #[serde(other)]
    Other,
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "file" => Ok(Self::File),
            "location" => Ok(Self::Location),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message type: {}", other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Message
// ═══════════════════════════════════════════════════════════════════════════════

/// A message as held by the reconciliation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Client-generated id, present for messages sent from this client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,

    /// Server-assigned id, present once acknowledged or received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,

    #[serde(rename = "type", default)]
    pub message_type: MessageType,

    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    /// The id that currently identifies this message: server id once assigned.
    pub fn key(&self) -> &str {
        self.server_id
            .as_deref()
            .or(self.local_id.as_deref())
            .unwrap_or_default()
    }

    /// Build a message received from the server.
    ///
    /// Remote messages carry no status on the wire unless the server sends
    /// one; they are at least `Sent` since the server has them.
    pub fn from_wire(wire: &WireMessage, conversation_id: &str) -> Self {
        let status = wire
            .status
            .filter(|s| s.is_confirmed())
            .unwrap_or(MessageStatus::Sent);
        let conversation_id = if wire.conversation_id.is_empty() {
            conversation_id.to_string()
        } else {
            wire.conversation_id.clone()
        };

        Self {
            local_id: wire.temp_id.clone(),
            server_id: Some(wire.server_id.clone()),
            conversation_id,
            sender_id: wire.sender_id.clone(),
            content: wire.content.clone(),
            message_type: wire.message_type,
            created_at: wire.created_at,
            status,
        }
    }
}

/// What the caller supplies to send a message.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
}

impl MessageDraft {
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        sender_id: impl Into<UserId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            message_type: MessageType::Text,
        }
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        use MessageStatus::*;

        assert!(Sending.can_advance_to(Sent));
        assert!(Sending.can_advance_to(Delivered));
        assert!(Sent.can_advance_to(Read));
        assert!(!Read.can_advance_to(Delivered));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Sent.can_advance_to(Sent));
    }

    #[test]
    fn test_failed_only_from_sending() {
        use MessageStatus::*;

        assert!(Sending.can_advance_to(Failed));
        assert!(!Sent.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Delivered));
    }

    #[test]
    fn test_unknown_message_type_deserializes_as_other() {
        let parsed: MessageType = serde_json::from_str("\"sticker\"").unwrap();
        assert_eq!(parsed, MessageType::Other);
        assert_eq!("IMAGE".parse::<MessageType>().unwrap(), MessageType::Image);
    }

    #[test]
    fn test_key_prefers_server_id() {
        let mut message = Message {
            local_id: Some("local-1".into()),
            server_id: None,
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            content: "hi".into(),
            message_type: MessageType::Text,
            created_at: Utc::now(),
            status: MessageStatus::Sending,
        };
        assert_eq!(message.key(), "local-1");

        message.server_id = Some("abc".into());
        assert_eq!(message.key(), "abc");
    }
}
