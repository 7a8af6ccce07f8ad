//! Outbound queue for events emitted while the socket is down.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{ChatError, Result};
use crate::protocol::ClientEvent;
use crate::telemetry::metrics::QueueMetrics;

/// A queued client event.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEnvelope {
    /// Local id of the message this envelope sends, if any
    pub local_id: Option<String>,
    pub event: ClientEvent,
    pub enqueued_at: Instant,
}

impl OutboundEnvelope {
    pub fn new(event: ClientEvent, enqueued_at: Instant) -> Self {
        Self {
            local_id: event.temp_id().map(str::to_string),
            event,
            enqueued_at,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// What an enqueue displaced.
#[derive(Debug, Default)]
pub struct EnqueueReport {
    /// Older typing intent for the same conversation
    pub superseded: Option<OutboundEnvelope>,
    /// Oldest envelope dropped because the queue was full
    pub evicted: Option<OutboundEnvelope>,
}

/// Outcome of a drain.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Envelopes accepted by the transport, in order
    pub sent: Vec<OutboundEnvelope>,
    /// Envelopes dropped for age
    pub expired: Vec<OutboundEnvelope>,
    /// The emit error that stopped the drain, if any
    pub halted: Option<ChatError>,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Envelopes waiting now
    pub pending: usize,
    /// Envelopes handed to the transport (total)
    pub drained: u64,
    /// Envelopes dropped for age or capacity (total)
    pub expired: u64,
    /// Typing intents replaced by a newer one (total)
    pub superseded: u64,
}

/// FIFO of envelopes awaiting a connection.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<OutboundEnvelope>,
    config: QueueConfig,
    stats: QueueStats,
}

impl OutboundQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            config,
            stats: QueueStats::default(),
        }
    }

    /// Append an envelope.
    ///
    /// A typing intent replaces any queued typing intent for the same
    /// conversation, so the latest one wins.
    pub fn enqueue(&mut self, envelope: OutboundEnvelope) -> EnqueueReport {
        let mut report = EnqueueReport::default();

        if envelope.event.is_typing_intent() {
            let conversation = envelope.event.conversation_id();
            if let Some(pos) = self.entries.iter().position(|queued| {
                queued.event.is_typing_intent() && queued.event.conversation_id() == conversation
            }) {
                report.superseded = self.entries.remove(pos);
                self.stats.superseded += 1;
            }
        }

        if self.entries.len() >= self.config.max_size {
            report.evicted = self.entries.pop_front();
            if let Some(evicted) = &report.evicted {
                self.stats.expired += 1;
                QueueMetrics::expired(1);
                warn!(
                    event = evicted.event.name(),
                    max_size = self.config.max_size,
                    "Outbound queue full, dropping oldest envelope"
                );
            }
        }

        debug!(event = envelope.event.name(), depth = self.entries.len() + 1, "Queued outbound event");
        self.entries.push_back(envelope);
        self.stats.pending = self.entries.len();
        QueueMetrics::depth(self.entries.len());
        report
    }

    /// Emit queued envelopes in order.
    ///
    /// Envelopes older than the TTL are dropped instead of emitted. An emit
    /// error stops the drain; the failed envelope and everything after it
    /// stay queued.
    pub fn drain<F>(&mut self, now: Instant, mut emit: F) -> DrainReport
    where
        F: FnMut(&ClientEvent) -> Result<()>,
    {
        let mut report = DrainReport::default();

        while let Some(envelope) = self.entries.pop_front() {
            if envelope.age(now) > self.config.ttl {
                ChatError::queue_expiry(envelope.event.name(), envelope.age(now)).log();
                report.expired.push(envelope);
                continue;
            }

            match emit(&envelope.event) {
                Ok(()) => report.sent.push(envelope),
                Err(error) => {
                    self.entries.push_front(envelope);
                    report.halted = Some(error);
                    break;
                }
            }
        }

        self.stats.drained += report.sent.len() as u64;
        self.stats.expired += report.expired.len() as u64;
        self.stats.pending = self.entries.len();
        QueueMetrics::expired(report.expired.len());
        QueueMetrics::depth(self.entries.len());

        debug!(
            sent = report.sent.len(),
            expired = report.expired.len(),
            remaining = self.entries.len(),
            "Drained outbound queue"
        );
        report
    }

    /// Drop the envelope carrying message `local_id` once it outlives the
    /// TTL while still offline.
    pub fn expire_message(&mut self, local_id: &str, now: Instant) -> Option<OutboundEnvelope> {
        let pos = self
            .entries
            .iter()
            .position(|queued| queued.local_id.as_deref() == Some(local_id))?;
        let envelope = self.entries.remove(pos)?;

        ChatError::queue_expiry(envelope.event.name(), envelope.age(now)).log();
        self.stats.expired += 1;
        self.stats.pending = self.entries.len();
        QueueMetrics::expired(1);
        QueueMetrics::depth(self.entries.len());
        Some(envelope)
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Queued events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &OutboundEnvelope> {
        self.entries.iter()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
