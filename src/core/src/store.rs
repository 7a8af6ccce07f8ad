//! Message reconciliation store.
//!
//! Holds every message of every conversation this session has seen, keyed by
//! local id (optimistic sends) and server id (once acknowledged or received).
//! Acknowledgements and status updates may arrive in any order relative to
//! each other; updates that name an id the store cannot resolve yet are
//! buffered and replayed when the id becomes known.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::message::{Message, MessageDraft, MessageStatus};
use crate::protocol::{ConversationId, WireMessage};

type EntryId = u64;

/// A status change applied to a message.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    /// The message after the change
    pub message: Message,
    /// Status before the change
    pub previous: MessageStatus,
}

/// Result of inserting a server-pushed message.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// A new message was appended
    Inserted(Message),
    /// The message was our own optimistic send; it was reconciled in place
    Reconciled(Vec<StatusChange>),
    /// The server id was already known
    Duplicate,
}

#[derive(Debug)]
pub struct ReconciliationStore {
    entries: HashMap<EntryId, Message>,
    next_entry: EntryId,
    timelines: HashMap<ConversationId, Vec<EntryId>>,
    by_local: HashMap<String, EntryId>,
    by_server: HashMap<String, EntryId>,
    /// Append-only local id → server id mapping
    id_map: HashMap<String, String>,
    pending: HashMap<String, Vec<MessageStatus>>,
    pending_order: VecDeque<String>,
    max_pending: usize,
}

impl ReconciliationStore {
    pub fn new(max_pending: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_entry: 0,
            timelines: HashMap::new(),
            by_local: HashMap::new(),
            by_server: HashMap::new(),
            id_map: HashMap::new(),
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            max_pending: max_pending.max(1),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Optimistic sends
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a `Sending` message under a fresh local id.
    pub fn create_optimistic(&mut self, draft: MessageDraft, created_at: DateTime<Utc>) -> Message {
        let local_id = format!("local-{}", Uuid::new_v4());
        let message = Message {
            local_id: Some(local_id.clone()),
            server_id: None,
            conversation_id: draft.conversation_id,
            sender_id: draft.sender_id,
            content: draft.content,
            message_type: draft.message_type,
            created_at,
            status: MessageStatus::Sending,
        };

        let entry = self.append(message.clone());
        self.by_local.insert(local_id, entry);
        message
    }

    /// Record the server's acknowledgement of an optimistic send.
    ///
    /// Returns every change applied: the flip to `Sent` followed by any
    /// buffered delivery/read updates, in path order.
    pub fn confirm_sent(&mut self, local_id: &str, server: &WireMessage) -> Result<Vec<StatusChange>> {
        let entry = *self
            .by_local
            .get(local_id)
            .ok_or_else(|| ChatError::unknown_message(local_id))?;

        if let Some(existing) = self.id_map.get(local_id) {
            if existing != &server.server_id {
                warn!(
                    local_id = %local_id,
                    mapped = %existing,
                    ignored = %server.server_id,
                    "Ignoring second server id for an already confirmed message"
                );
            }
            return Ok(Vec::new());
        }

        // A `new_message` echo may have arrived before the ack.
        let mut echoed = None;
        if let Some(&echo) = self.by_server.get(&server.server_id) {
            if echo != entry {
                echoed = self.remove_entry(echo).map(|m| m.status);
            }
        }

        let mut changes = Vec::new();
        {
            let message = self
                .entries
                .get_mut(&entry)
                .ok_or_else(|| ChatError::internal("Dangling store entry"))?;
            let previous = message.status;
            message.server_id = Some(server.server_id.clone());
            if matches!(previous, MessageStatus::Sending | MessageStatus::Failed) {
                message.status = MessageStatus::Sent;
            }
            changes.push(StatusChange {
                message: message.clone(),
                previous,
            });
        }

        self.by_server.insert(server.server_id.clone(), entry);
        self.id_map.insert(local_id.to_string(), server.server_id.clone());

        let mut buffered = self.take_pending(&server.server_id);
        buffered.extend(self.take_pending(local_id));
        buffered.extend(echoed);
        changes.extend(self.replay(entry, buffered));

        debug!(
            local_id = %local_id,
            server_id = %server.server_id,
            replayed = changes.len() - 1,
            "Message confirmed"
        );
        Ok(changes)
    }

    /// Apply a delivery/read update naming either a server or a local id.
    ///
    /// Updates for ids not yet known, or for messages not yet acknowledged,
    /// are buffered. Backward updates are ignored.
    pub fn apply_status_update(&mut self, id: &str, status: MessageStatus) -> Option<StatusChange> {
        if status == MessageStatus::Failed {
            return self.mark_failed(id);
        }

        let Some(entry) = self.resolve(id) else {
            self.buffer(id, status);
            return None;
        };

        let unconfirmed = self
            .entries
            .get(&entry)
            .map(|m| m.server_id.is_none())
            .unwrap_or(true);
        if unconfirmed {
            self.buffer(id, status);
            return None;
        }

        self.advance(entry, status)
    }

    /// Mark an unacknowledged message failed. No-op once acknowledged.
    pub fn mark_failed(&mut self, local_id: &str) -> Option<StatusChange> {
        let entry = *self.by_local.get(local_id)?;
        let message = self.entries.get_mut(&entry)?;
        if message.status != MessageStatus::Sending || message.server_id.is_some() {
            return None;
        }

        let previous = message.status;
        message.status = MessageStatus::Failed;
        Some(StatusChange {
            message: message.clone(),
            previous,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Server-originated messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a message pushed by the server.
    pub fn insert_remote(&mut self, wire: &WireMessage) -> Result<InsertOutcome> {
        if self.by_server.contains_key(&wire.server_id) {
            return Ok(InsertOutcome::Duplicate);
        }

        if let Some(temp_id) = wire.temp_id.as_deref() {
            if self.by_local.contains_key(temp_id) {
                let changes = self.confirm_sent(temp_id, wire)?;
                return Ok(InsertOutcome::Reconciled(changes));
            }
        }

        let message = Message::from_wire(wire, &wire.conversation_id);
        let entry = self.append(message);
        self.index_and_replay(entry);

        let message = self
            .entries
            .get(&entry)
            .cloned()
            .ok_or_else(|| ChatError::internal("Dangling store entry"))?;
        Ok(InsertOutcome::Inserted(message))
    }

    /// Merge a page of REST history. Older messages go before everything
    /// already held; ids already known are skipped.
    ///
    /// Returns the number of messages added.
    pub fn merge_history(&mut self, conversation_id: &str, page: Vec<WireMessage>) -> Result<usize> {
        let mut added = Vec::new();
        for wire in page {
            if self.by_server.contains_key(&wire.server_id) {
                continue;
            }
            if let Some(temp_id) = wire.temp_id.as_deref() {
                if self.by_local.contains_key(temp_id) {
                    self.confirm_sent(temp_id, &wire)?;
                    continue;
                }
            }

            let message = Message::from_wire(&wire, conversation_id);
            let entry = self.insert_entry(message);
            self.index_and_replay(entry);
            added.push(entry);
        }

        let count = added.len();
        if count > 0 {
            let timeline = self.timelines.entry(conversation_id.to_string()).or_default();
            added.extend(timeline.drain(..));
            *timeline = added;
        }
        Ok(count)
    }

    /// Load cached messages for offline display.
    ///
    /// A cached message still `Sending` belongs to a previous session whose
    /// confirmation window is gone, so it is restored as `Failed`.
    pub fn hydrate(&mut self, conversation_id: &str, cached: Vec<Message>) -> usize {
        let mut added = Vec::new();
        for mut message in cached {
            let known = message
                .server_id
                .as_deref()
                .map(|id| self.by_server.contains_key(id))
                .unwrap_or(false)
                || message
                    .local_id
                    .as_deref()
                    .map(|id| self.by_local.contains_key(id))
                    .unwrap_or(false);
            if known {
                continue;
            }

            if message.status == MessageStatus::Sending {
                message.status = if message.server_id.is_some() {
                    MessageStatus::Sent
                } else {
                    MessageStatus::Failed
                };
            }
            message.conversation_id = conversation_id.to_string();

            let entry = self.insert_entry(message);
            self.index_and_replay(entry);
            added.push(entry);
        }

        let count = added.len();
        if count > 0 {
            let timeline = self.timelines.entry(conversation_id.to_string()).or_default();
            added.extend(timeline.drain(..));
            *timeline = added;
        }
        count
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Messages of a conversation in display order.
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.timelines
            .get(conversation_id)
            .map(|timeline| {
                timeline
                    .iter()
                    .filter_map(|entry| self.entries.get(entry).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look a message up by server or local id.
    pub fn get(&self, id: &str) -> Option<&Message> {
        self.resolve(id).and_then(|entry| self.entries.get(&entry))
    }

    pub fn server_id_for(&self, local_id: &str) -> Option<&str> {
        self.id_map.get(local_id).map(String::as_str)
    }

    /// Ids with buffered updates.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn resolve(&self, id: &str) -> Option<EntryId> {
        self.by_server
            .get(id)
            .or_else(|| self.by_local.get(id))
            .copied()
    }

    fn insert_entry(&mut self, message: Message) -> EntryId {
        let entry = self.next_entry;
        self.next_entry += 1;
        self.entries.insert(entry, message);
        entry
    }

    fn append(&mut self, message: Message) -> EntryId {
        let conversation_id = message.conversation_id.clone();
        let entry = self.insert_entry(message);
        self.timelines.entry(conversation_id).or_default().push(entry);
        entry
    }

    fn index_remote(&mut self, entry: EntryId) {
        let Some(message) = self.entries.get(&entry) else {
            return;
        };
        let server_id = message.server_id.clone();
        let local_id = message.local_id.clone();

        if let Some(server_id) = server_id.clone() {
            self.by_server.insert(server_id, entry);
        }
        if let Some(local_id) = local_id {
            self.by_local.insert(local_id.clone(), entry);
            if let Some(server_id) = server_id {
                self.id_map.entry(local_id).or_insert(server_id);
            }
        }
    }

    /// Index an entry that arrived with its server id and apply any updates
    /// buffered for it.
    fn index_and_replay(&mut self, entry: EntryId) -> Vec<StatusChange> {
        self.index_remote(entry);

        let Some(message) = self.entries.get(&entry) else {
            return Vec::new();
        };
        let Some(server_id) = message.server_id.clone() else {
            return Vec::new();
        };
        let local_id = message.local_id.clone();

        let mut buffered = self.take_pending(&server_id);
        if let Some(local_id) = local_id {
            buffered.extend(self.take_pending(&local_id));
        }
        self.replay(entry, buffered)
    }

    fn remove_entry(&mut self, entry: EntryId) -> Option<Message> {
        let message = self.entries.remove(&entry)?;
        if let Some(timeline) = self.timelines.get_mut(&message.conversation_id) {
            timeline.retain(|e| *e != entry);
        }
        if let Some(server_id) = &message.server_id {
            self.by_server.remove(server_id);
        }
        Some(message)
    }

    fn advance(&mut self, entry: EntryId, status: MessageStatus) -> Option<StatusChange> {
        let message = self.entries.get_mut(&entry)?;
        if !message.status.can_advance_to(status) {
            debug!(
                message_id = %message.key(),
                current = %message.status,
                ignored = %status,
                "Ignoring non-forward status update"
            );
            return None;
        }

        let previous = message.status;
        message.status = status;
        Some(StatusChange {
            message: message.clone(),
            previous,
        })
    }

    fn replay(&mut self, entry: EntryId, mut statuses: Vec<MessageStatus>) -> Vec<StatusChange> {
        statuses.sort_by_key(|s| s.rank());
        statuses
            .into_iter()
            .filter_map(|status| self.advance(entry, status))
            .collect()
    }

    fn buffer(&mut self, id: &str, status: MessageStatus) {
        let slot = self.pending.entry(id.to_string()).or_default();
        if slot.is_empty() {
            self.pending_order.push_back(id.to_string());
        }
        if !slot.contains(&status) {
            slot.push(status);
        }

        while self.pending.len() > self.max_pending {
            let Some(oldest) = self.pending_order.pop_front() else {
                break;
            };
            if self.pending.remove(&oldest).is_some() {
                warn!(message_id = %oldest, "Dropping buffered status updates");
            }
        }

        debug!(message_id = %id, status = %status, "Buffered status update for unresolved id");
    }

    fn take_pending(&mut self, id: &str) -> Vec<MessageStatus> {
        match self.pending.remove(id) {
            Some(statuses) => {
                self.pending_order.retain(|queued| queued != id);
                statuses
            }
            None => Vec::new(),
        }
    }
}

impl Default for ReconciliationStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(text: &str) -> MessageDraft {
        MessageDraft::new("c1", "me", text)
    }

    fn ack(server_id: &str) -> WireMessage {
        WireMessage::new(server_id, "c1", "me", "hi")
    }

    #[test]
    fn test_full_lifecycle_visits_statuses_in_order() {
        let mut store = ReconciliationStore::default();
        let msg = store.create_optimistic(draft("hi"), Utc::now());
        let local = msg.local_id.clone().unwrap();
        assert_eq!(msg.status, MessageStatus::Sending);

        let changes = store.confirm_sent(&local, &ack("abc")).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].message.status, MessageStatus::Sent);

        let delivered = store.apply_status_update("abc", MessageStatus::Delivered).unwrap();
        assert_eq!(delivered.previous, MessageStatus::Sent);
        let read = store.apply_status_update("abc", MessageStatus::Read).unwrap();
        assert_eq!(read.message.status, MessageStatus::Read);

        let messages = store.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].server_id.as_deref(), Some("abc"));
        assert_eq!(store.server_id_for(&local), Some("abc"));
    }

    #[test]
    fn test_delivered_before_confirm_is_replayed() {
        let mut store = ReconciliationStore::default();
        let msg = store.create_optimistic(draft("hi"), Utc::now());
        let local = msg.local_id.unwrap();

        assert!(store.apply_status_update("abc", MessageStatus::Delivered).is_none());
        assert_eq!(store.pending_len(), 1);

        let changes = store.confirm_sent(&local, &ack("abc")).unwrap();
        let statuses: Vec<_> = changes.iter().map(|c| c.message.status).collect();
        assert_eq!(statuses, vec![MessageStatus::Sent, MessageStatus::Delivered]);
        assert_eq!(store.get("abc").unwrap().status, MessageStatus::Delivered);
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_update_by_local_id_before_confirm_is_buffered() {
        let mut store = ReconciliationStore::default();
        let local = store.create_optimistic(draft("hi"), Utc::now()).local_id.unwrap();

        assert!(store.apply_status_update(&local, MessageStatus::Read).is_none());
        assert_eq!(store.get(&local).unwrap().status, MessageStatus::Sending);

        store.confirm_sent(&local, &ack("abc")).unwrap();
        assert_eq!(store.get(&local).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_backward_updates_are_ignored() {
        let mut store = ReconciliationStore::default();
        let local = store.create_optimistic(draft("hi"), Utc::now()).local_id.unwrap();
        store.confirm_sent(&local, &ack("abc")).unwrap();
        store.apply_status_update("abc", MessageStatus::Read);

        assert!(store.apply_status_update("abc", MessageStatus::Delivered).is_none());
        assert_eq!(store.get("abc").unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_mapping_is_append_only() {
        let mut store = ReconciliationStore::default();
        let local = store.create_optimistic(draft("hi"), Utc::now()).local_id.unwrap();
        store.confirm_sent(&local, &ack("abc")).unwrap();

        let changes = store.confirm_sent(&local, &ack("xyz")).unwrap();
        assert!(changes.is_empty());
        assert_eq!(store.server_id_for(&local), Some("abc"));
        assert!(store.get("xyz").is_none());
    }

    #[test]
    fn test_mark_failed_never_touches_confirmed_messages() {
        let mut store = ReconciliationStore::default();
        let local = store.create_optimistic(draft("hi"), Utc::now()).local_id.unwrap();
        store.confirm_sent(&local, &ack("abc")).unwrap();
        assert!(store.mark_failed(&local).is_none());

        let other = store.create_optimistic(draft("again"), Utc::now()).local_id.unwrap();
        let change = store.mark_failed(&other).unwrap();
        assert_eq!(change.message.status, MessageStatus::Failed);
        assert!(change.message.server_id.is_none());
    }

    #[test]
    fn test_late_confirm_revives_failed_message() {
        let mut store = ReconciliationStore::default();
        let local = store.create_optimistic(draft("hi"), Utc::now()).local_id.unwrap();
        store.mark_failed(&local).unwrap();

        let changes = store.confirm_sent(&local, &ack("abc")).unwrap();
        assert_eq!(changes[0].previous, MessageStatus::Failed);
        assert_eq!(changes[0].message.status, MessageStatus::Sent);
    }

    #[test]
    fn test_confirm_unknown_local_id_is_an_error() {
        let mut store = ReconciliationStore::default();
        assert!(store.confirm_sent("local-missing", &ack("abc")).is_err());
    }

    #[test]
    fn test_new_message_echo_with_temp_id_reconciles() {
        let mut store = ReconciliationStore::default();
        let local = store.create_optimistic(draft("hi"), Utc::now()).local_id.unwrap();

        let outcome = store.insert_remote(&ack("abc").with_temp_id(local.clone())).unwrap();
        assert!(matches!(outcome, InsertOutcome::Reconciled(_)));
        assert_eq!(store.messages("c1").len(), 1);

        assert_eq!(store.insert_remote(&ack("abc")).unwrap(), InsertOutcome::Duplicate);
    }

    #[test]
    fn test_echo_without_temp_id_is_merged_on_confirm() {
        let mut store = ReconciliationStore::default();
        let local = store.create_optimistic(draft("hi"), Utc::now()).local_id.unwrap();

        assert!(matches!(
            store.insert_remote(&ack("abc")).unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(store.messages("c1").len(), 2);

        store.confirm_sent(&local, &ack("abc")).unwrap();
        let messages = store.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].local_id.as_deref(), Some(local.as_str()));
    }

    #[test]
    fn test_remote_message_picks_up_early_status() {
        let mut store = ReconciliationStore::default();
        store.apply_status_update("m1", MessageStatus::Read);

        match store.insert_remote(&WireMessage::new("m1", "c1", "u2", "yo")).unwrap() {
            InsertOutcome::Inserted(message) => assert_eq!(message.status, MessageStatus::Read),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_pending_buffer_is_bounded() {
        let mut store = ReconciliationStore::new(2);
        store.apply_status_update("a", MessageStatus::Delivered);
        store.apply_status_update("b", MessageStatus::Delivered);
        store.apply_status_update("c", MessageStatus::Delivered);

        assert_eq!(store.pending_len(), 2);
        store.insert_remote(&WireMessage::new("a", "c1", "u2", "x")).unwrap();
        assert_eq!(store.get("a").unwrap().status, MessageStatus::Sent);
    }

    #[test]
    fn test_history_prepends_and_skips_known() {
        let mut store = ReconciliationStore::default();
        store.insert_remote(&WireMessage::new("m3", "c1", "u2", "new")).unwrap();

        let page = vec![
            WireMessage::new("m1", "c1", "u2", "old"),
            WireMessage::new("m2", "c1", "u2", "older"),
            WireMessage::new("m3", "c1", "u2", "new"),
        ];
        assert_eq!(store.merge_history("c1", page).unwrap(), 2);

        let ids: Vec<_> = store
            .messages("c1")
            .iter()
            .map(|m| m.server_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_history_picks_up_early_status() {
        let mut store = ReconciliationStore::default();
        assert!(store.apply_status_update("m1", MessageStatus::Read).is_none());
        assert_eq!(store.pending_len(), 1);

        let page = vec![WireMessage::new("m1", "c1", "u2", "backfilled")];
        assert_eq!(store.merge_history("c1", page).unwrap(), 1);

        assert_eq!(store.get("m1").unwrap().status, MessageStatus::Read);
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_hydrate_picks_up_early_status() {
        let mut store = ReconciliationStore::default();
        store.apply_status_update("m1", MessageStatus::Delivered);

        let cached = Message::from_wire(&WireMessage::new("m1", "c1", "me", "cached"), "c1");
        assert_eq!(store.hydrate("c1", vec![cached]), 1);

        assert_eq!(store.get("m1").unwrap().status, MessageStatus::Delivered);
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn test_hydrate_marks_stale_sending_failed() {
        let mut store = ReconciliationStore::default();
        let mut stale = ReconciliationStore::default();
        let cached = stale.create_optimistic(draft("lost"), Utc::now());

        assert_eq!(store.hydrate("c1", vec![cached.clone()]), 1);
        let restored = store.get(cached.local_id.as_deref().unwrap()).unwrap();
        assert_eq!(restored.status, MessageStatus::Failed);

        assert_eq!(store.hydrate("c1", vec![cached]), 0);
    }
}
