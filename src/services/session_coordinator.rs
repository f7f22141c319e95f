//! Reacts to session lifecycle notifications by resetting or ending the countdown.
//!
//! Lookups of session data run as spawned tasks. Their results come back through
//! [`SessionCoordinator::next_update`] tagged with the session generation they were
//! started for, and only the latest generation is ever applied.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    dao::session_source::{SessionSource, load_summary},
    dto::{channel::SessionLifecycle, session::SessionSummary},
    error::SessionResult,
    state::timer::{TimerReconciler, TimerStatus},
};

/// Completion of a session lookup.
#[derive(Debug)]
pub struct SessionUpdate {
    generation: u64,
    result: SessionResult<SessionSummary>,
}

/// Keeps the reconciler in step with the session lifecycle.
pub struct SessionCoordinator {
    source: Arc<dyn SessionSource>,
    generation: u64,
    inflight: Option<JoinHandle<()>>,
    refresh: Option<JoinHandle<()>>,
    updates_tx: mpsc::UnboundedSender<SessionUpdate>,
    updates_rx: mpsc::UnboundedReceiver<SessionUpdate>,
}

impl SessionCoordinator {
    /// Create a coordinator reading session data from `source`.
    pub fn new(source: Arc<dyn SessionSource>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            source,
            generation: 0,
            inflight: None,
            refresh: None,
            updates_tx,
            updates_rx,
        }
    }

    /// Current session generation, bumped on every lifecycle change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Apply a lifecycle notification to `timer`.
    pub fn handle(&mut self, lifecycle: &SessionLifecycle, timer: &mut TimerReconciler) {
        match lifecycle {
            SessionLifecycle::Created => self.on_created(timer),
            SessionLifecycle::Ended => self.on_ended(timer),
            SessionLifecycle::Other(name) => debug!(event = %name, "ignoring game notification"),
        }
    }

    /// A new session started: show the built-in defaults right away and look up the
    /// session's own values in the background.
    pub fn on_created(&mut self, timer: &mut TimerReconciler) {
        self.next_generation();
        info!(generation = self.generation, "session created");
        timer.reset(timer.fallback_defaults());

        let source = self.source.clone();
        let tx = self.updates_tx.clone();
        let generation = self.generation;
        self.inflight = Some(tokio::spawn(async move {
            let result = load_summary(source.as_ref()).await;
            let _ = tx.send(SessionUpdate { generation, result });
        }));
    }

    /// The session finished: end the countdown and refresh the cached session.
    pub fn on_ended(&mut self, timer: &mut TimerReconciler) {
        self.next_generation();
        info!(generation = self.generation, "session ended");
        timer.end();

        let refresh = self.source.refresh();
        let task = tokio::spawn(async move {
            if let Err(err) = refresh.await {
                warn!(error = %err, "failed to refresh session after it ended");
            }
        });
        if let Some(previous) = self.refresh.replace(task) {
            previous.abort();
        }
    }

    /// Wait for the next lookup completion. Never completes while nothing is in
    /// flight. Cancel safe.
    pub async fn next_update(&mut self) -> SessionUpdate {
        match self.updates_rx.recv().await {
            Some(update) => update,
            // The coordinator keeps a sender alive, so the queue never closes.
            None => std::future::pending().await,
        }
    }

    /// Apply a lookup completion to `timer`, discarding results of older sessions.
    pub fn apply(&mut self, update: SessionUpdate, timer: &mut TimerReconciler) {
        if update.generation != self.generation {
            debug!(
                generation = update.generation,
                current = self.generation,
                "discarding stale session lookup"
            );
            return;
        }
        self.inflight = None;

        match update.result {
            Ok(summary) if timer.status() == TimerStatus::Idle => {
                info!(
                    ruleset_id = summary.ruleset_id,
                    initial_duration = summary.initial_duration,
                    alarm_time = summary.alarm_time,
                    "applying session defaults"
                );
                timer.reset(summary.into());
            }
            Ok(summary) => {
                // A snapshot already started the countdown; keep its value.
                debug!(status = ?timer.status(), "session already running; only updating alarm");
                timer.set_alarm_time(summary.alarm_time);
            }
            Err(err) => {
                warn!(error = %err, "session lookup failed; keeping built-in defaults");
            }
        }
    }

    fn next_generation(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.inflight.take() {
            handle.abort();
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        for handle in [self.inflight.take(), self.refresh.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}
