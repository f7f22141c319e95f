//! Countdown state machine reconciling authoritative snapshots with local ticking.
//!
//! ```text
//! Idle ──snapshot──▶ Playing ⇄ Paused ──end──▶ Ended ──reset──▶ Idle
//! ```
//!
//! Snapshots overwrite the remaining time (corrected for transit delay using the
//! clock offset); between snapshots a local tick loop subtracts elapsed time so the
//! rendered value moves smoothly. The tick loop exists if and only if the status is
//! [`TimerStatus::Playing`].

use std::time::Duration;

use tokio::{
    sync::watch,
    time::{Instant, Interval, MissedTickBehavior, interval_at},
};
use tracing::{debug, info};

use crate::{error::SnapshotError, state::clock::ClockOffsetEstimator};

/// Status carried by an authoritative snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// The authoritative countdown is running.
    Playing,
    /// The authoritative countdown is frozen.
    Paused,
}

/// Point-in-time statement of the authoritative countdown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerSnapshot {
    /// Server time (seconds since the epoch) at which `remaining_time` was measured.
    pub server_timestamp: f64,
    /// Seconds left on the authoritative timer.
    pub remaining_time: f64,
    /// Whether the authoritative timer is running.
    pub status: SnapshotStatus,
}

impl TimerSnapshot {
    /// Reject snapshots carrying NaN or infinite numbers.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if !self.server_timestamp.is_finite() {
            return Err(SnapshotError::NonFiniteTimestamp(self.server_timestamp));
        }
        if !self.remaining_time.is_finite() {
            return Err(SnapshotError::NonFiniteRemaining(self.remaining_time));
        }
        Ok(())
    }
}

/// Local status of the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerStatus {
    /// No session timer has been started yet.
    #[default]
    Idle,
    /// Counting down locally between snapshots.
    Playing,
    /// Frozen until the next snapshot says otherwise.
    Paused,
    /// The session finished; only a reset leaves this state.
    Ended,
}

impl From<SnapshotStatus> for TimerStatus {
    fn from(value: SnapshotStatus) -> Self {
        match value {
            SnapshotStatus::Playing => TimerStatus::Playing,
            SnapshotStatus::Paused => TimerStatus::Paused,
        }
    }
}

/// Values a session starts from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerDefaults {
    /// Remaining time shown before the first snapshot of the session.
    pub initial_duration: f64,
    /// Threshold (seconds) under which the countdown is flagged as alarming.
    pub alarm_time: f64,
}

/// Rendered countdown published to observers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerView {
    /// Seconds left, never negative.
    pub remaining_time: f64,
    /// Current local status.
    pub status: TimerStatus,
    /// Whether the countdown is inside the alarm window.
    pub alarm: bool,
}

impl TimerView {
    /// Remaining time rendered as `MM:SS.t`.
    pub fn label(&self) -> String {
        let tenths = (self.remaining_time.max(0.0) * 10.0).floor() as u64;
        let minutes = tenths / 600;
        let seconds = (tenths % 600) / 10;
        format!("{minutes:02}:{seconds:02}.{}", tenths % 10)
    }
}

/// Static tuning for the reconciler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerSettings {
    /// Period of the local tick loop.
    pub tick_period: Duration,
    /// Defaults used before any session data is known.
    pub defaults: TimerDefaults,
    /// Remaining time displayed once a session has ended.
    pub idle_remaining: f64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(300),
            defaults: TimerDefaults {
                initial_duration: 60.0,
                alarm_time: 10.0,
            },
            idle_remaining: 60.0,
        }
    }
}

/// Repeating local timer driving interpolation between snapshots.
struct TickLoop {
    interval: Interval,
    last: Instant,
}

impl TickLoop {
    fn start(period: Duration) -> Self {
        let now = Instant::now();
        let mut interval = interval_at(now + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            interval,
            last: now,
        }
    }
}

/// Countdown state owned by a single execution context.
pub struct TimerReconciler {
    settings: TimerSettings,
    remaining: f64,
    status: TimerStatus,
    alarm_time: f64,
    tick: Option<TickLoop>,
    tick_loops_started: u64,
    view: watch::Sender<TimerView>,
}

impl TimerReconciler {
    /// Create an idle reconciler showing the configured default duration.
    pub fn new(settings: TimerSettings) -> Self {
        let remaining = clamp_remaining(settings.defaults.initial_duration);
        let alarm_time = settings.defaults.alarm_time;
        let (view, _rx) = watch::channel(TimerView {
            remaining_time: remaining,
            status: TimerStatus::Idle,
            alarm: false,
        });
        Self {
            settings,
            remaining,
            status: TimerStatus::Idle,
            alarm_time,
            tick: None,
            tick_loops_started: 0,
            view,
        }
    }

    /// Seconds left on the local countdown.
    pub fn remaining_time(&self) -> f64 {
        self.remaining
    }

    /// Current local status.
    pub fn status(&self) -> TimerStatus {
        self.status
    }

    /// Alarm threshold of the current session.
    pub fn alarm_time(&self) -> f64 {
        self.alarm_time
    }

    /// Whether a tick loop is currently scheduled.
    pub fn is_ticking(&self) -> bool {
        self.tick.is_some()
    }

    /// Number of tick loops started since construction.
    pub fn tick_loops_started(&self) -> u64 {
        self.tick_loops_started
    }

    /// Current rendered value.
    pub fn view(&self) -> TimerView {
        TimerView {
            remaining_time: self.remaining,
            status: self.status,
            alarm: self.alarm_active(),
        }
    }

    /// Observe every published [`TimerView`].
    pub fn subscribe(&self) -> watch::Receiver<TimerView> {
        self.view.subscribe()
    }

    /// Reconcile an authoritative snapshot into local state.
    ///
    /// The remaining time becomes `max(0, remaining - max(0, server_now - timestamp))`
    /// where `server_now` is local time shifted by the current clock offset. A status
    /// change always stops the running tick loop before a new one is started, so at
    /// most one loop is ever alive. Invalid snapshots leave the state untouched.
    pub fn apply_snapshot(
        &mut self,
        snapshot: TimerSnapshot,
        clock: &ClockOffsetEstimator,
    ) -> Result<(), SnapshotError> {
        snapshot.validate()?;

        if self.status == TimerStatus::Ended {
            debug!(?snapshot, "ignoring snapshot for an ended session");
            return Ok(());
        }

        let elapsed = (clock.server_now() - snapshot.server_timestamp).max(0.0);
        self.remaining = clamp_remaining(snapshot.remaining_time - elapsed);

        let next = TimerStatus::from(snapshot.status);
        if next != self.status {
            info!(from = ?self.status, to = ?next, "timer status changed");
            self.status = next;
            self.stop_ticking();
            if next == TimerStatus::Playing {
                self.start_ticking();
            }
        } else if let Some(tick) = self.tick.as_mut() {
            // The snapshot already accounts for time up to now.
            tick.last = Instant::now();
        }

        debug!(
            remaining = self.remaining,
            elapsed,
            status = ?self.status,
            "snapshot reconciled"
        );
        self.publish();
        Ok(())
    }

    /// Wait for the next tick of the local loop and apply it.
    ///
    /// Never completes while no loop is running, which makes it suitable as a
    /// `tokio::select!` branch. Cancel safe.
    pub async fn next_tick(&mut self) {
        let Some(tick) = self.tick.as_mut() else {
            return std::future::pending().await;
        };
        tick.interval.tick().await;

        let now = Instant::now();
        let elapsed = now.duration_since(tick.last).as_secs_f64();
        tick.last = now;
        self.remaining = clamp_remaining(self.remaining - elapsed);
        self.publish();
    }

    /// Start a new session: cancel ticking, go idle and show `defaults.initial_duration`.
    pub fn reset(&mut self, defaults: TimerDefaults) {
        self.stop_ticking();
        self.status = TimerStatus::Idle;
        self.remaining = if defaults.initial_duration.is_finite() {
            clamp_remaining(defaults.initial_duration)
        } else {
            clamp_remaining(self.settings.defaults.initial_duration)
        };
        self.set_alarm_time(defaults.alarm_time);
        info!(remaining = self.remaining, "timer reset");
        self.publish();
    }

    /// Finish the session: cancel ticking and show the idle value.
    pub fn end(&mut self) {
        self.stop_ticking();
        self.status = TimerStatus::Ended;
        self.remaining = clamp_remaining(self.settings.idle_remaining);
        info!("timer ended");
        self.publish();
    }

    /// Update the alarm threshold without touching the countdown.
    pub fn set_alarm_time(&mut self, alarm_time: f64) {
        self.alarm_time = if alarm_time.is_finite() {
            alarm_time.max(0.0)
        } else {
            self.settings.defaults.alarm_time
        };
        self.publish();
    }

    /// Built-in defaults used when no session data could be loaded.
    pub fn fallback_defaults(&self) -> TimerDefaults {
        self.settings.defaults
    }

    fn start_ticking(&mut self) {
        if self.tick.is_some() {
            return;
        }
        self.tick = Some(TickLoop::start(self.settings.tick_period));
        self.tick_loops_started += 1;
    }

    fn stop_ticking(&mut self) {
        self.tick = None;
    }

    fn alarm_active(&self) -> bool {
        matches!(self.status, TimerStatus::Playing | TimerStatus::Paused)
            && self.remaining > 0.0
            && self.remaining <= self.alarm_time
    }

    fn publish(&self) {
        debug_assert_eq!(self.tick.is_some(), self.status == TimerStatus::Playing);
        self.view.send_replace(self.view());
    }
}

/// `f64::max` already maps NaN to the other operand.
fn clamp_remaining(value: f64) -> f64 {
    value.max(0.0)
}
