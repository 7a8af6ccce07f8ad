//! Presence and typing aggregation.
//!
//! Typing indicators expire on their own: every `typing_start` refreshes a
//! per-user deadline, and the session's timer calls [`PresenceTracker::expire`]
//! when it passes. Expiry re-checks the stored deadline so a timer armed
//! before a refresh cannot clear the refreshed entry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::protocol::{ConversationId, UserId};

/// Result of a typing update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingOutcome {
    /// Whether the set of typing users changed
    pub membership_changed: bool,
    /// New deadline when the user is typing
    pub expires_at: Option<Instant>,
}

#[derive(Debug)]
pub struct PresenceTracker {
    typing: HashMap<ConversationId, HashMap<UserId, Instant>>,
    online: HashSet<UserId>,
    typing_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(typing_timeout: Duration) -> Self {
        Self {
            typing: HashMap::new(),
            online: HashSet::new(),
            typing_timeout,
        }
    }

    /// Insert/refresh (`is_typing`) or remove a typing user.
    pub fn set_typing(
        &mut self,
        conversation_id: &str,
        user_id: &str,
        is_typing: bool,
        now: Instant,
    ) -> TypingOutcome {
        if is_typing {
            let expires_at = now + self.typing_timeout;
            let previous = self
                .typing
                .entry(conversation_id.to_string())
                .or_default()
                .insert(user_id.to_string(), expires_at);
            return TypingOutcome {
                membership_changed: previous.is_none(),
                expires_at: Some(expires_at),
            };
        }

        TypingOutcome {
            membership_changed: self.remove_typing(conversation_id, user_id),
            expires_at: None,
        }
    }

    /// Remove a typing entry whose deadline has passed.
    ///
    /// Returns `false` when the entry was refreshed past `now` or is gone.
    pub fn expire(&mut self, conversation_id: &str, user_id: &str, now: Instant) -> bool {
        let due = self
            .typing
            .get(conversation_id)
            .and_then(|users| users.get(user_id))
            .map(|deadline| *deadline <= now)
            .unwrap_or(false);

        if due {
            trace!(conversation_id = %conversation_id, user_id = %user_id, "Typing indicator expired");
            self.remove_typing(conversation_id, user_id)
        } else {
            false
        }
    }

    /// Users typing in a conversation, sorted.
    pub fn typing_users(&self, conversation_id: &str) -> Vec<UserId> {
        self.typing
            .get(conversation_id)
            .map(|users| {
                users
                    .keys()
                    .cloned()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Update a user's presence. Going offline also clears their typing
    /// entries. Returns the conversations whose typing set changed when the
    /// user went offline, or `None` when presence did not change.
    pub fn set_online(&mut self, user_id: &str, online: bool) -> Option<Vec<ConversationId>> {
        if online {
            return self.online.insert(user_id.to_string()).then(Vec::new);
        }

        if !self.online.remove(user_id) {
            return None;
        }

        let mut cleared: Vec<ConversationId> = self
            .typing
            .iter()
            .filter(|(_, users)| users.contains_key(user_id))
            .map(|(conversation_id, _)| conversation_id.clone())
            .collect();
        cleared.sort();
        for conversation_id in &cleared {
            self.remove_typing(conversation_id, user_id);
        }
        Some(cleared)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    /// Online users, sorted.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<_> = self.online.iter().cloned().collect();
        users.sort();
        users
    }

    /// Drop every typing indicator. Returns the conversations that had any.
    pub fn clear_typing(&mut self) -> Vec<ConversationId> {
        let mut conversations: Vec<_> = self
            .typing
            .drain()
            .filter(|(_, users)| !users.is_empty())
            .map(|(conversation_id, _)| conversation_id)
            .collect();
        conversations.sort();
        conversations
    }

    fn remove_typing(&mut self, conversation_id: &str, user_id: &str) -> bool {
        let Some(users) = self.typing.get_mut(conversation_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.typing.remove(conversation_id);
        }
        removed
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typing_expires_after_timeout() {
        let mut presence = PresenceTracker::default();
        let start = Instant::now();

        let outcome = presence.set_typing("c1", "u2", true, start);
        assert!(outcome.membership_changed);
        assert_eq!(outcome.expires_at, Some(start + Duration::from_secs(3)));
        assert_eq!(presence.typing_users("c1"), vec!["u2".to_string()]);

        assert!(!presence.expire("c1", "u2", start + Duration::from_secs(2)));
        assert!(presence.expire("c1", "u2", start + Duration::from_secs(3)));
        assert!(presence.typing_users("c1").is_empty());
    }

    #[test]
    fn test_refresh_outlives_earlier_deadline() {
        let mut presence = PresenceTracker::default();
        let start = Instant::now();

        presence.set_typing("c1", "u2", true, start);
        let refreshed = presence.set_typing("c1", "u2", true, start + Duration::from_secs(2));
        assert!(!refreshed.membership_changed);

        assert!(!presence.expire("c1", "u2", start + Duration::from_secs(3)));
        assert_eq!(presence.typing_users("c1").len(), 1);
    }

    #[test]
    fn test_stop_removes_and_reports_change() {
        let mut presence = PresenceTracker::default();
        let now = Instant::now();
        presence.set_typing("c1", "u2", true, now);

        assert!(presence.set_typing("c1", "u2", false, now).membership_changed);
        assert!(!presence.set_typing("c1", "u2", false, now).membership_changed);
    }

    #[test]
    fn test_offline_clears_typing() {
        let mut presence = PresenceTracker::default();
        let now = Instant::now();

        assert_eq!(presence.set_online("u2", true), Some(vec![]));
        assert_eq!(presence.set_online("u2", true), None);
        presence.set_typing("c1", "u2", true, now);
        presence.set_typing("c2", "u2", true, now);

        assert_eq!(
            presence.set_online("u2", false),
            Some(vec!["c1".to_string(), "c2".to_string()])
        );
        assert!(!presence.is_online("u2"));
        assert!(presence.typing_users("c1").is_empty());
    }
}
