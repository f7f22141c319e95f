//! Wall-clock access and the server/local clock offset estimate.

use std::{
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::debug;

/// Source of wall-clock time expressed as seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current local time in seconds since the epoch.
    fn now_seconds(&self) -> f64;
}

/// Shared handle to a [`Clock`].
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// Clock whose reading only moves when told to, used by simulations and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `now` seconds.
    pub fn new(now: f64) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Jump to an absolute reading.
    pub fn set(&self, now: f64) {
        *self.lock() = now;
    }

    /// Move the reading forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        *self.lock() += seconds;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, f64> {
        // A poisoned f64 is still a valid reading.
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> f64 {
        *self.lock()
    }
}

/// Tracks `server_now - local_now` from sync samples.
///
/// Last sample wins: every call to [`update`](Self::update) overwrites the previous
/// estimate. Until the first sample arrives the clocks are assumed to agree.
pub struct ClockOffsetEstimator {
    clock: SharedClock,
    offset: Option<f64>,
}

impl ClockOffsetEstimator {
    /// Create an estimator reading local time from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            offset: None,
        }
    }

    /// Record a sync sample carrying the server's current time. Non-finite samples
    /// are ignored.
    pub fn update(&mut self, server_timestamp: f64) {
        if !server_timestamp.is_finite() {
            debug!(server_timestamp, "ignoring non-finite sync sample");
            return;
        }
        let offset = server_timestamp - self.clock.now_seconds();
        debug!(offset, "clock offset updated");
        self.offset = Some(offset);
    }

    /// Last computed offset in seconds, `0.0` before any sample.
    pub fn current_offset(&self) -> f64 {
        self.offset.unwrap_or(0.0)
    }

    /// Whether at least one sync sample has been applied.
    pub fn is_calibrated(&self) -> bool {
        self.offset.is_some()
    }

    /// Local time shifted onto the server's timeline.
    pub fn server_now(&self) -> f64 {
        self.clock.now_seconds() + self.current_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator_at(now: f64) -> (Arc<ManualClock>, ClockOffsetEstimator) {
        let clock = Arc::new(ManualClock::new(now));
        let estimator = ClockOffsetEstimator::new(clock.clone());
        (clock, estimator)
    }

    #[test]
    fn offset_defaults_to_zero() {
        let (_, estimator) = estimator_at(1_000.0);
        assert_eq!(estimator.current_offset(), 0.0);
        assert!(!estimator.is_calibrated());
        assert_eq!(estimator.server_now(), 1_000.0);
    }

    #[test]
    fn local_clock_ahead_gives_negative_offset() {
        let (_, mut estimator) = estimator_at(107.0);
        estimator.update(102.0);
        assert_eq!(estimator.current_offset(), -5.0);
        assert_eq!(estimator.server_now(), 102.0);
    }

    #[test]
    fn last_sample_wins() {
        let (clock, mut estimator) = estimator_at(100.0);
        estimator.update(110.0);
        clock.advance(1.0);
        estimator.update(98.0);
        assert_eq!(estimator.current_offset(), -3.0);
    }

    #[test]
    fn non_finite_sample_keeps_previous_estimate() {
        let (_, mut estimator) = estimator_at(100.0);
        estimator.update(101.5);
        estimator.update(f64::NAN);
        estimator.update(f64::INFINITY);
        assert_eq!(estimator.current_offset(), 1.5);
    }
}
