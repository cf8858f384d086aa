//! Time sources.
//!
//! Every timestamp written by the queue, the lock store, and the task state machine
//! comes from a [`Clock`]. Production code uses [`SystemClock`]; tests inject a
//! [`MockClock`] so delayed jobs, lock expiry, retention windows, and task timeouts
//! can be exercised deterministically without waiting for real time to pass.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// A source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for controlling time in tests.
///
/// Clones share the same underlying instant, so a clock handed to a store can be
/// advanced from the test body.
///
/// # Examples
///
/// ```rust
/// use batchwork::clock::{Clock, MockClock};
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let initial_time = clock.now();
///
/// clock.advance(Duration::hours(1));
///
/// assert_eq!((clock.now() - initial_time).num_hours(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a mock clock frozen at a specific instant.
    pub fn starting_at(time: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Advance the mock time by the given duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *time += duration;
    }

    /// Set the mock time to a specific instant.
    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Convenience constructor for the wall clock as a [`SharedClock`].
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::new();
        let start = clock.now();

        clock.advance(Duration::days(1));
        clock.advance(Duration::minutes(30));

        assert_eq!((clock.now() - start).num_minutes(), 24 * 60 + 30);
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::new();
        let shared: SharedClock = Arc::new(clock.clone());

        clock.advance(Duration::seconds(10));
        assert_eq!(shared.now(), clock.now());
    }

    #[test]
    fn test_mock_clock_set_time() {
        let clock = MockClock::new();
        let specific = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        clock.set_time(specific);
        assert_eq!(clock.now(), specific);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
