//! Time sources.
//!
//! The session never reads the system clock directly. Every expiry
//! (reconnect backoff, send confirmation, typing indicators, queue TTL) is
//! measured against a [`Clock`], so tests can drive time by hand.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic and wall-clock time source.
pub trait Clock: Send + Sync + Debug {
    /// Monotonic instant used for all deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock time stamped on optimistic messages.
    fn wall(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
struct ManualClockState {
    base: Instant,
    base_wall: DateTime<Utc>,
    offset: Duration,
}

/// A clock that only moves when told to.
///
/// Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualClockState>>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualClockState {
                base: Instant::now(),
                base_wall: Utc::now(),
                offset: Duration::ZERO,
            })),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.state.lock().offset += by;
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().offset
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.state.lock();
        state.base + state.offset
    }

    fn wall(&self) -> DateTime<Utc> {
        let state = self.state.lock();
        let offset = chrono::Duration::from_std(state.offset).unwrap_or_else(|_| chrono::Duration::zero());
        state.base_wall + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_timelines() {
        let clock = ManualClock::new();
        let start = clock.now();
        let start_wall = clock.wall();

        clock.advance(Duration::from_secs(3));

        assert_eq!(clock.now() - start, Duration::from_secs(3));
        assert_eq!((clock.wall() - start_wall).num_seconds(), 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();
        let start = clock.now();

        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
    }
}
