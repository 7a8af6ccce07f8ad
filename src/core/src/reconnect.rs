//! Connection state machine with bounded exponential backoff.
//!
//! Allowed transitions:
//!
//! ```text
//! Disconnected → Connecting → Connected
//! Connected    → Reconnecting → Connected
//! Reconnecting → Failed                  (attempts exhausted)
//! any          → Disconnected            (explicit teardown)
//! ```
//!
//! The controller only decides; the session owns the timer and the socket.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ReconnectConfig;
use crate::error::{ChatError, Result};
use crate::telemetry::metrics::ConnectionMetrics;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a socket closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// We closed it
    ClientInitiated,
    /// The server sent a close frame
    ServerInitiated,
    /// The stream ended without a close frame
    TransportClose,
    /// Read or write failed
    TransportError,
    /// The handshake did not complete in time
    PingTimeout,
}

impl CloseReason {
    /// Drops we try to recover from.
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::ClientInitiated)
    }
}

/// What the session should do after a close or failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Arm the reconnect timer for `delay`; `attempt` is 1-based
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted; the state is now `Failed`
    GiveUp { attempts: u32 },
    /// Nothing to do
    Stay,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectMetrics {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub max_attempts: u32,
    pub total_retries: u64,
    pub total_failures: u64,
}

/// Owner of [`ConnectionState`].
#[derive(Debug)]
pub struct ReconnectController {
    state: ConnectionState,
    /// Consecutive failed attempts since the last `Connected`
    attempt: u32,
    config: ReconnectConfig,
    total_retries: u64,
    total_failures: u64,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            config,
            total_retries: 0,
            total_failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Move to `next`, returning the previous state.
    ///
    /// A transition to the current state is a no-op.
    pub fn transition(&mut self, next: ConnectionState) -> Result<ConnectionState> {
        let previous = self.state;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_transition_to(next) {
            let error = ChatError::invalid_transition(previous, next);
            error.log();
            return Err(error);
        }

        self.state = next;
        ConnectionMetrics::state(next);
        info!(from = %previous, to = %next, "Connection state changed");
        Ok(previous)
    }

    /// Explicit `connect()`.
    pub fn begin_connect(&mut self) -> Result<ConnectionState> {
        let previous = self.transition(ConnectionState::Connecting)?;
        self.attempt = 0;
        Ok(previous)
    }

    /// The socket finished its handshake.
    pub fn on_opened(&mut self) -> Result<ConnectionState> {
        let previous = self.transition(ConnectionState::Connected)?;
        if self.attempt > 0 {
            info!(attempts = self.attempt, "Reconnected");
        }
        self.attempt = 0;
        Ok(previous)
    }

    /// The socket closed or failed.
    ///
    /// Only a drop after `Connected` is retried. A handshake that never
    /// completed ends in `Disconnected`.
    pub fn on_closed(&mut self, reason: CloseReason) -> ReconnectDecision {
        match self.state {
            ConnectionState::Connected if reason.is_retryable() => {
                if self.transition(ConnectionState::Reconnecting).is_err() {
                    return ReconnectDecision::Stay;
                }
                warn!(reason = ?reason, "Connection lost, scheduling reconnect");
                ReconnectDecision::Retry {
                    attempt: self.attempt + 1,
                    delay: self.delay_for(self.attempt),
                }
            }
            ConnectionState::Connected | ConnectionState::Connecting => {
                if self.state == ConnectionState::Connecting {
                    self.total_failures += 1;
                    warn!(reason = ?reason, "Initial connection failed");
                }
                let _ = self.transition(ConnectionState::Disconnected);
                self.attempt = 0;
                ReconnectDecision::Stay
            }
            ConnectionState::Reconnecting => self.on_attempt_failed(),
            ConnectionState::Disconnected | ConnectionState::Failed => ReconnectDecision::Stay,
        }
    }

    /// A reconnection attempt did not reach `Connected`.
    pub fn on_attempt_failed(&mut self) -> ReconnectDecision {
        if self.state != ConnectionState::Reconnecting {
            return ReconnectDecision::Stay;
        }

        self.attempt = self.attempt.saturating_add(1);
        self.total_failures += 1;

        if self.attempt >= self.config.max_attempts {
            let _ = self.transition(ConnectionState::Failed);
            ConnectionMetrics::reconnect_exhausted();
            warn!(
                attempts = self.attempt,
                max_attempts = self.config.max_attempts,
                "Reconnection attempts exhausted"
            );
            return ReconnectDecision::GiveUp {
                attempts: self.attempt,
            };
        }

        let delay = self.delay_for(self.attempt);
        warn!(
            failures = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnection attempt failed"
        );
        ReconnectDecision::Retry {
            attempt: self.attempt + 1,
            delay,
        }
    }

    /// The backoff timer fired. Returns the attempt number, or `None` when
    /// the controller is no longer reconnecting.
    pub fn begin_retry(&mut self) -> Option<u32> {
        if self.state != ConnectionState::Reconnecting {
            return None;
        }
        let attempt = self.attempt + 1;
        self.total_retries += 1;
        ConnectionMetrics::reconnect_attempt(attempt);
        info!(attempt, max_attempts = self.config.max_attempts, "Reconnecting");
        Some(attempt)
    }

    /// `min(base * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    /// Explicit `disconnect()`.
    pub fn teardown(&mut self) -> ConnectionState {
        let previous = self.state;
        let _ = self.transition(ConnectionState::Disconnected);
        self.attempt = 0;
        previous
    }

    /// The server rejected our credentials. Terminal until the next `connect()`.
    pub fn on_auth_rejected(&mut self) -> ConnectionState {
        ConnectionMetrics::auth_failure();
        self.teardown()
    }

    pub fn metrics(&self) -> ReconnectMetrics {
        ReconnectMetrics {
            state: self.state,
            consecutive_failures: self.attempt,
            max_attempts: self.config.max_attempts,
            total_retries: self.total_retries,
            total_failures: self.total_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn controller() -> ReconnectController {
        ReconnectController::new(ReconnectConfig::default())
    }

    fn connected() -> ReconnectController {
        let mut controller = controller();
        controller.begin_connect().unwrap();
        controller.on_opened().unwrap();
        controller
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let controller = controller();
        let delays: Vec<u64> = (0..7).map(|a| controller.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(controller.delay_for(64), Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut controller = controller();
        let err = controller.transition(ConnectionState::Connected).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert_eq!(controller.state(), ConnectionState::Disconnected);

        assert!(controller.transition(ConnectionState::Failed).is_err());
    }

    #[test]
    fn test_drop_schedules_first_retry() {
        let mut controller = connected();
        let decision = controller.on_closed(CloseReason::TransportClose);
        assert_eq!(
            decision,
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(controller.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_client_close_does_not_retry() {
        let mut controller = connected();
        assert_eq!(
            controller.on_closed(CloseReason::ClientInitiated),
            ReconnectDecision::Stay
        );
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_five_failures_give_up() {
        let mut controller = connected();
        controller.on_closed(CloseReason::ServerInitiated);

        let mut delays = Vec::new();
        let mut outcome = ReconnectDecision::Stay;
        for _ in 0..5 {
            assert!(controller.begin_retry().is_some());
            outcome = controller.on_attempt_failed();
            if let ReconnectDecision::Retry { delay, .. } = outcome {
                delays.push(delay.as_secs());
            }
        }

        assert_eq!(delays, vec![2, 4, 8, 16]);
        assert_eq!(outcome, ReconnectDecision::GiveUp { attempts: 5 });
        assert_eq!(controller.state(), ConnectionState::Failed);
        assert_eq!(controller.begin_retry(), None);
    }

    #[test]
    fn test_success_resets_attempts() {
        let mut controller = connected();
        controller.on_closed(CloseReason::TransportError);
        controller.begin_retry();
        controller.on_attempt_failed();
        assert_eq!(controller.attempt(), 1);

        controller.on_opened().unwrap();
        assert_eq!(controller.attempt(), 0);
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_initial_connect_failure_ends_disconnected() {
        let mut controller = controller();
        controller.begin_connect().unwrap();
        let decision = controller.on_closed(CloseReason::TransportError);
        assert_eq!(decision, ReconnectDecision::Stay);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
        assert_eq!(controller.metrics().total_failures, 1);
        assert!(!ConnectionState::Connecting.can_transition_to(ConnectionState::Reconnecting));
    }

    #[test]
    fn test_failed_requires_explicit_connect() {
        let mut controller = connected();
        controller.on_closed(CloseReason::TransportError);
        for _ in 0..5 {
            controller.on_attempt_failed();
        }
        assert_eq!(controller.state(), ConnectionState::Failed);
        assert!(controller.begin_connect().is_err());

        controller.teardown();
        assert!(controller.begin_connect().is_ok());
    }
}
