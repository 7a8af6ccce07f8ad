//! Local message cache for offline display.
//!
//! Keeps the most recent messages of each conversation, bounded per
//! conversation (oldest evicted first).
//!
//! - **InMemoryMessageCache**: process-local, for tests and ephemeral sessions
//! - **FileMessageCache**: one JSON document per conversation under a directory

pub mod backend;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;

pub use backend::{FileMessageCache, InMemoryMessageCache};

/// Default messages kept per conversation.
pub const DEFAULT_CAPACITY: usize = 100;

/// Persistent store of recent messages keyed by conversation.
#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Cached messages in display order. Empty when nothing is cached.
    async fn load(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// Replace a conversation's cached messages, keeping only the most recent
    /// [`MessageCache::capacity`].
    async fn store(&self, conversation_id: &str, messages: &[Message]) -> Result<()>;

    /// Drop a conversation.
    async fn clear(&self, conversation_id: &str) -> Result<()>;

    /// Messages kept per conversation.
    fn capacity(&self) -> usize;
}

/// The trailing `capacity` messages.
pub fn retain_recent(messages: &[Message], capacity: usize) -> &[Message] {
    let start = messages.len().saturating_sub(capacity);
    &messages[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageStatus, MessageType};
    use chrono::Utc;

    fn message(id: usize) -> Message {
        Message {
            local_id: None,
            server_id: Some(format!("m{}", id)),
            conversation_id: "c1".into(),
            sender_id: "u1".into(),
            content: format!("#{}", id),
            message_type: MessageType::Text,
            created_at: Utc::now(),
            status: MessageStatus::Sent,
        }
    }

    #[test]
    fn test_retain_recent_keeps_tail() {
        let messages: Vec<_> = (0..5).map(message).collect();
        let kept = retain_recent(&messages, 3);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].server_id.as_deref(), Some("m2"));
        assert_eq!(retain_recent(&messages, 10).len(), 5);
    }
}
