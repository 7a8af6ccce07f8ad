//! Session metrics through the `metrics` facade.
//!
//! The library only records; the embedding application decides whether to
//! install a recorder (Prometheus, statsd, ...). Without one every call is a
//! no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use eventconnect_core::telemetry::metrics::{describe_metrics, MessageMetrics};
//!
//! describe_metrics();
//! MessageMetrics::sent();
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::Once;
use std::time::Duration;

use crate::message::MessageStatus;
use crate::reconnect::ConnectionState;

static DESCRIBE: Once = Once::new();

/// Register all metric descriptions. Safe to call more than once.
pub fn describe_metrics() {
    DESCRIBE.call_once(|| {
        // Connection metrics
        describe_gauge!(
            "chat_connection_state",
            "Connection state (0=disconnected, 1=connecting, 2=connected, 3=reconnecting, 4=failed)"
        );
        describe_counter!(
            "chat_reconnect_attempts_total",
            "Automatic reconnection attempts started"
        );
        describe_counter!("chat_reconnect_exhausted_total", "Times reconnection gave up");
        describe_counter!("chat_auth_failures_total", "Handshakes rejected by the server");

        // Message metrics
        describe_counter!("chat_messages_sent_total", "Messages created by this client");
        describe_counter!(
            "chat_messages_confirmed_total",
            "Messages acknowledged by the server"
        );
        describe_counter!("chat_messages_failed_total", "Messages marked failed");
        describe_histogram!(
            "chat_message_ack_seconds",
            "Time from hand-off to server acknowledgement"
        );
        describe_counter!(
            "chat_status_updates_total",
            "Delivery/read status updates applied"
        );

        // Queue metrics
        describe_gauge!("chat_queue_depth", "Envelopes waiting for the connection");
        describe_counter!("chat_queue_expired_total", "Envelopes dropped after the TTL");

        // Error metrics
        describe_counter!("chat_errors_total", "Errors by code and category");
    });
}

/// Connection lifecycle metrics.
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Record the current connection state.
    pub fn state(state: ConnectionState) {
        let value = match state {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Reconnecting => 3.0,
            ConnectionState::Failed => 4.0,
        };
        gauge!("chat_connection_state").set(value);
    }

    /// Record a retry being started.
    pub fn reconnect_attempt(attempt: u32) {
        counter!("chat_reconnect_attempts_total", "attempt" => attempt.to_string()).increment(1);
    }

    /// Record the controller giving up.
    pub fn reconnect_exhausted() {
        counter!("chat_reconnect_exhausted_total").increment(1);
    }

    /// Record a rejected handshake.
    pub fn auth_failure() {
        counter!("chat_auth_failures_total").increment(1);
    }
}

/// Message lifecycle metrics.
pub struct MessageMetrics;

impl MessageMetrics {
    /// Record an optimistic send.
    pub fn sent() {
        counter!("chat_messages_sent_total").increment(1);
    }

    /// Record a server acknowledgement and its latency.
    pub fn confirmed(latency: Option<Duration>) {
        counter!("chat_messages_confirmed_total").increment(1);
        if let Some(latency) = latency {
            histogram!("chat_message_ack_seconds").record(latency.as_secs_f64());
        }
    }

    /// Record a message marked failed.
    pub fn failed(reason: &'static str) {
        counter!("chat_messages_failed_total", "reason" => reason).increment(1);
    }

    /// Record an applied status change.
    pub fn status_update(status: MessageStatus) {
        counter!("chat_status_updates_total", "status" => status.as_str()).increment(1);
    }
}

/// Outbound queue metrics.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record the queue depth.
    pub fn depth(depth: usize) {
        gauge!("chat_queue_depth").set(depth as f64);
    }

    /// Record envelopes dropped for age.
    pub fn expired(count: usize) {
        counter!("chat_queue_expired_total").increment(count as u64);
    }
}
