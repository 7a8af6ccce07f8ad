//! Message cache backends.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{retain_recent, MessageCache};
use crate::error::{ChatError, ErrorCode, Result};
use crate::message::Message;

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct InMemoryMessageCache {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
    capacity: usize,
}

impl InMemoryMessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for InMemoryMessageCache {
    fn default() -> Self {
        Self::new(super::DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageCache for InMemoryMessageCache {
    async fn load(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .conversations
            .read()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn store(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        let kept = retain_recent(messages, self.capacity).to_vec();
        self.conversations
            .write()
            .insert(conversation_id.to_string(), kept);
        Ok(())
    }

    async fn clear(&self, conversation_id: &str) -> Result<()> {
        self.conversations.write().remove(conversation_id);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// File Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
struct CachedConversation {
    conversation_id: String,
    saved_at: chrono::DateTime<chrono::Utc>,
    messages: Vec<Message>,
}

/// One JSON file per conversation. Writes go through a temp file and a rename
/// so a crash never leaves a truncated document.
#[derive(Debug, Clone)]
pub struct FileMessageCache {
    directory: PathBuf,
    capacity: usize,
}

impl FileMessageCache {
    pub fn new(directory: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            directory: directory.into(),
            capacity: capacity.max(1),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// File for a conversation. Bytes outside `[A-Za-z0-9_-]` are written as
    /// `%XX`, so distinct ids never share a file.
    fn path_for(&self, conversation_id: &str) -> PathBuf {
        let mut name = String::with_capacity(conversation_id.len());
        for byte in conversation_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                name.push(char::from(byte));
            } else {
                name.push_str(&format!("%{:02X}", byte));
            }
        }
        self.directory.join(format!("{}.json", name))
    }
}

#[async_trait]
impl MessageCache for FileMessageCache {
    async fn load(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let path = self.path_for(conversation_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<CachedConversation>(&bytes) {
            Ok(cached) => Ok(cached.messages),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding unreadable cache file");
                Ok(Vec::new())
            }
        }
    }

    async fn store(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;

        let document = CachedConversation {
            conversation_id: conversation_id.to_string(),
            saved_at: chrono::Utc::now(),
            messages: retain_recent(messages, self.capacity).to_vec(),
        };
        let bytes = serde_json::to_vec(&document).map_err(|e| {
            ChatError::with_internal(ErrorCode::CacheError, "Failed to encode cache", e.to_string())
        })?;

        let path = self.path_for(conversation_id);
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(
            conversation_id,
            count = document.messages.len(),
            path = %path.display(),
            "Cached conversation"
        );
        Ok(())
    }

    async fn clear(&self, conversation_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(conversation_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
