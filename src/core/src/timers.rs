//! Deadline table for the session's single timer.
//!
//! The session keeps at most one deadline per [`TimerKey`]. The runtime sleeps
//! until [`TimerTable::next_deadline`] and then pops everything that has
//! expired. Scheduling a key that is already present replaces its deadline.

use std::collections::HashMap;
use std::time::Instant;

use crate::protocol::{ConversationId, UserId};

/// What a deadline is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Backoff elapsed; `generation` must still match for the retry to run.
    Reconnect { generation: u64 },
    /// The server has not acknowledged this message yet.
    SendTimeout { local_id: String },
    /// This message is still queued and its envelope ages out.
    QueueExpiry { local_id: String },
    /// A remote user's typing indicator lapses.
    TypingExpiry {
        conversation_id: ConversationId,
        user_id: UserId,
    },
}

#[derive(Debug, Default)]
pub struct TimerTable {
    deadlines: HashMap<TimerKey, Instant>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `key` to fire at `at`, replacing any earlier deadline for it.
    pub fn schedule(&mut self, key: TimerKey, at: Instant) {
        self.deadlines.insert(key, at);
    }

    /// Disarm `key`. Returns whether it was armed.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Disarm every key matching `predicate`.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&TimerKey) -> bool) -> usize {
        let before = self.deadlines.len();
        self.deadlines.retain(|key, _| !predicate(key));
        before - self.deadlines.len()
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn deadline(&self, key: &TimerKey) -> Option<Instant> {
        self.deadlines.get(key).copied()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every key due at `now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut due: Vec<(TimerKey, Instant)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, at)| (key.clone(), *at))
            .collect();
        due.sort_by_key(|(_, at)| *at);

        for (key, _) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(key, _)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn send_key(id: &str) -> TimerKey {
        TimerKey::SendTimeout {
            local_id: id.to_string(),
        }
    }

    #[test]
    fn test_pop_expired_returns_due_keys_in_order() {
        let base = Instant::now();
        let mut timers = TimerTable::new();
        timers.schedule(send_key("b"), base + Duration::from_secs(2));
        timers.schedule(send_key("a"), base + Duration::from_secs(1));
        timers.schedule(send_key("c"), base + Duration::from_secs(10));

        let due = timers.pop_expired(base + Duration::from_secs(5));
        assert_eq!(due, vec![send_key("a"), send_key("b")]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(base + Duration::from_secs(10)));
    }

    #[test]
    fn test_reschedule_replaces_deadline() {
        let base = Instant::now();
        let mut timers = TimerTable::new();
        let key = TimerKey::TypingExpiry {
            conversation_id: "c1".into(),
            user_id: "u1".into(),
        };
        timers.schedule(key.clone(), base + Duration::from_secs(3));
        timers.schedule(key.clone(), base + Duration::from_secs(5));

        assert!(timers.pop_expired(base + Duration::from_secs(4)).is_empty());
        assert_eq!(timers.deadline(&key), Some(base + Duration::from_secs(5)));
    }

    #[test]
    fn test_cancel_where_filters_by_kind() {
        let base = Instant::now();
        let mut timers = TimerTable::new();
        timers.schedule(TimerKey::Reconnect { generation: 1 }, base);
        timers.schedule(send_key("a"), base);

        let removed = timers.cancel_where(|key| matches!(key, TimerKey::Reconnect { .. }));
        assert_eq!(removed, 1);
        assert!(timers.is_scheduled(&send_key("a")));
        assert!(timers.cancel(&send_key("a")));
        assert!(timers.is_empty());
    }
}
