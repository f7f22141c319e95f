//! Single cooperative loop wiring the channel, the clock, the countdown and the
//! session coordinator together.
//!
//! Every component is owned by [`SyncEngine`] and only mutated from its loop, so a
//! snapshot, a tick and a session lookup completion are always handled one after
//! the other, in arrival order.

use tokio::{
    sync::{oneshot, watch},
    task::{JoinError, JoinHandle},
};
use tracing::{debug, info, warn};

use crate::{
    dto::channel::InboundMessage,
    error::ChannelError,
    services::{
        channel::{ChannelEvent, ChannelManager, ChannelOptions},
        session_coordinator::{SessionCoordinator, SessionUpdate},
    },
    state::{
        clock::ClockOffsetEstimator,
        connection::ConnectionState,
        timer::{TimerReconciler, TimerView},
    },
};

/// Something the loop woke up for.
enum Step {
    Channel(ChannelEvent),
    Tick,
    Session(SessionUpdate),
}

/// Owns one instance of every component and routes channel events between them.
pub struct SyncEngine {
    channel: ChannelManager,
    clock: ClockOffsetEstimator,
    timer: TimerReconciler,
    sessions: SessionCoordinator,
}

impl SyncEngine {
    /// Assemble an engine from its components.
    pub fn new(
        channel: ChannelManager,
        clock: ClockOffsetEstimator,
        timer: TimerReconciler,
        sessions: SessionCoordinator,
    ) -> Self {
        Self {
            channel,
            clock,
            timer,
            sessions,
        }
    }

    /// Channel manager, e.g. to register extra subscribers before starting.
    pub fn channel_mut(&mut self) -> &mut ChannelManager {
        &mut self.channel
    }

    /// Read access to the countdown.
    pub fn timer(&self) -> &TimerReconciler {
        &self.timer
    }

    /// Read access to the clock offset estimate.
    pub fn clock(&self) -> &ClockOffsetEstimator {
        &self.clock
    }

    /// Open the channel and run the loop on a background task.
    pub fn start(mut self, endpoint: impl Into<String>, options: ChannelOptions) -> EngineHandle {
        let timer = self.timer.subscribe();
        let connection = self.channel.state_watcher();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        self.channel.connect(endpoint, options);
        let task = tokio::spawn(self.run(shutdown_rx));

        EngineHandle {
            shutdown: Some(shutdown_tx),
            task,
            timer,
            connection,
        }
    }

    /// Run until `shutdown` fires (or its sender is dropped), then close the channel.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!("sync engine started");
        loop {
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                step = self.next_step() => step,
            };
            self.handle(step);
        }

        self.channel.disconnect();
        info!("sync engine stopped");
    }

    async fn next_step(&mut self) -> Step {
        tokio::select! {
            event = self.channel.recv() => Step::Channel(event),
            () = self.timer.next_tick() => Step::Tick,
            update = self.sessions.next_update() => Step::Session(update),
        }
    }

    fn handle(&mut self, step: Step) {
        match step {
            Step::Channel(ChannelEvent::Message(message)) => self.route(message),
            Step::Channel(_) | Step::Tick => {}
            Step::Session(update) => self.sessions.apply(update, &mut self.timer),
        }
    }

    fn route(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Sync { server_time } => self.clock.update(server_time),
            InboundMessage::Timer(snapshot) => {
                if let Err(err) = self.timer.apply_snapshot(snapshot, &self.clock) {
                    warn!(error = %err, ?snapshot, "rejecting timer snapshot");
                    self.channel.report(ChannelError::Snapshot(err));
                }
            }
            InboundMessage::Session(lifecycle) => self.sessions.handle(&lifecycle, &mut self.timer),
            InboundMessage::Other { event, .. } => {
                debug!(%event, "no route for channel event");
            }
        }
    }
}

/// Handle on a running [`SyncEngine`]. Dropping it also stops the engine.
pub struct EngineHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    timer: watch::Receiver<TimerView>,
    connection: watch::Receiver<ConnectionState>,
}

impl EngineHandle {
    /// Observe the rendered countdown.
    pub fn timer(&self) -> watch::Receiver<TimerView> {
        self.timer.clone()
    }

    /// Observe connectivity.
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Disconnect the channel and wait for the loop to finish.
    pub async fn shutdown(mut self) -> Result<(), JoinError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.task).await
    }
}
