//! Owner of the single logical connection to the authoritative source.
//!
//! A background supervisor task opens transports, pumps frames and runs the
//! reconnection backoff. Everything it observes is sent back as epoch-tagged signals
//! and applied by [`ChannelManager::recv`] on the owner's execution context, which is
//! also where subscriber callbacks run. Bumping the epoch on `connect`/`disconnect`
//! makes every signal of a cancelled supervisor stale, so nothing it queued before
//! being aborted can reach a subscriber afterwards.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use indexmap::IndexMap;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    dto::channel::{InboundMessage, decode_frame},
    error::{ChannelError, HandlerError, TransportError},
    services::transport::{Connector, Transport, TransportKind},
    state::connection::ConnectionState,
};

/// Event name of successful (re)connections.
pub const EVENT_CONNECT: &str = "connect";
/// Event name of transport losses.
pub const EVENT_DISCONNECT: &str = "disconnect";
/// Event name of failed connection attempts.
pub const EVENT_CONNECT_ERROR: &str = "connect_error";
/// Event name emitted before each reconnection backoff.
pub const EVENT_RECONNECT_ATTEMPT: &str = "reconnect_attempt";
/// Event name emitted when a reconnection succeeded.
pub const EVENT_RECONNECT: &str = "reconnect";
/// Event name of every [`ConnectionState`] change.
pub const EVENT_STATE: &str = "state";
/// Event name of [`ChannelError`] reports.
pub const EVENT_ERROR: &str = "error";

/// Signals a supervisor may queue before it waits for [`ChannelManager::recv`].
const SIGNAL_QUEUE_CAPACITY: usize = 256;

/// Identifier returned by [`ChannelManager::subscribe`].
pub type SubscriptionId = Uuid;

/// Callback registered for one event name.
pub type Handler = Box<dyn FnMut(&ChannelEvent) -> Result<(), HandlerError> + Send>;

/// Upper bound on reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAttempts {
    /// Give up after this many consecutive failed attempts.
    Limited(u32),
    /// Retry forever.
    Unbounded,
}

impl ReconnectAttempts {
    fn allows(self, attempt: u32) -> bool {
        match self {
            ReconnectAttempts::Limited(max) => attempt <= max,
            ReconnectAttempts::Unbounded => true,
        }
    }
}

/// Connection options recognised by [`ChannelManager::connect`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOptions {
    /// Transports tried in order on every attempt.
    pub transports: Vec<TransportKind>,
    /// Whether transport failures trigger automatic reconnection.
    pub reconnection: bool,
    /// How many consecutive reconnection attempts are allowed.
    pub max_reconnection_attempts: ReconnectAttempts,
    /// Delay before the first reconnection attempt.
    pub reconnection_delay: Duration,
    /// Cap of the exponential backoff.
    pub reconnection_delay_max: Duration,
    /// Time allowed for one transport to connect.
    pub connect_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            transports: vec![TransportKind::Websocket, TransportKind::Polling],
            reconnection: true,
            max_reconnection_attempts: ReconnectAttempts::Unbounded,
            reconnection_delay: Duration::from_millis(1_000),
            reconnection_delay_max: Duration::from_millis(5_000),
            connect_timeout: Duration::from_millis(20_000),
        }
    }
}

impl ChannelOptions {
    /// Backoff before reconnection attempt `attempt` (1-based): the base delay doubled
    /// per previous attempt, capped at `reconnection_delay_max`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.reconnection_delay
            .saturating_mul(1u32 << exponent)
            .min(self.reconnection_delay_max)
    }
}

/// Everything the channel can deliver to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Decoded frame from the authoritative source.
    Message(InboundMessage),
    /// A transport is live.
    Connected,
    /// The live transport went away.
    Disconnected {
        /// Human-readable cause.
        reason: String,
    },
    /// A connection attempt failed.
    ConnectError {
        /// Human-readable cause.
        message: String,
    },
    /// A reconnection attempt is scheduled after `delay`.
    ReconnectAttempt {
        /// 1-based attempt number.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// Connectivity came back after `attempts` reconnection attempts.
    Reconnected {
        /// Number of attempts it took.
        attempts: u32,
    },
    /// The connection state changed.
    StateChanged(ConnectionState),
    /// Something went wrong that subscribers should know about.
    Error(ChannelError),
}

impl ChannelEvent {
    /// Name under which subscribers receive this event.
    pub fn name(&self) -> &str {
        match self {
            ChannelEvent::Message(message) => message.event_name(),
            ChannelEvent::Connected => EVENT_CONNECT,
            ChannelEvent::Disconnected { .. } => EVENT_DISCONNECT,
            ChannelEvent::ConnectError { .. } => EVENT_CONNECT_ERROR,
            ChannelEvent::ReconnectAttempt { .. } => EVENT_RECONNECT_ATTEMPT,
            ChannelEvent::Reconnected { .. } => EVENT_RECONNECT,
            ChannelEvent::StateChanged(_) => EVENT_STATE,
            ChannelEvent::Error(_) => EVENT_ERROR,
        }
    }
}

/// Signal sent by a supervisor, tagged with the epoch it was spawned in.
struct Signal {
    epoch: u64,
    event: ChannelEvent,
}

/// Manages the push channel: connection lifecycle, reconnection and dispatch.
pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    subscribers: IndexMap<String, Vec<(SubscriptionId, Handler)>>,
    epoch: u64,
    signal_tx: mpsc::Sender<Signal>,
    signal_rx: mpsc::Receiver<Signal>,
    supervisor: Option<JoinHandle<()>>,
}

impl ChannelManager {
    /// Create a disconnected manager opening transports through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _rx) = watch::channel(ConnectionState::Disconnected);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        Self {
            connector,
            state: ConnectionState::Disconnected,
            state_tx,
            subscribers: IndexMap::new(),
            epoch: 0,
            signal_tx,
            signal_rx,
            supervisor: None,
        }
    }

    /// Current connectivity.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Observe connectivity changes.
    pub fn state_watcher(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Open the channel towards `endpoint`, replacing any previous connection.
    pub fn connect(&mut self, endpoint: impl Into<String>, options: ChannelOptions) {
        let endpoint = endpoint.into();
        if self.supervisor.is_some() {
            self.disconnect();
        }

        self.epoch += 1;
        info!(%endpoint, transports = ?options.transports, "opening event channel");
        self.set_state(ConnectionState::Connecting);

        let supervisor = Supervisor {
            endpoint,
            options,
            connector: self.connector.clone(),
            tx: self.signal_tx.clone(),
            epoch: self.epoch,
        };
        self.supervisor = Some(tokio::spawn(supervisor.run()));
    }

    /// Close the channel and cancel any pending reconnection. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
        // Anything the aborted supervisor already queued is now stale.
        self.epoch += 1;

        if self.state != ConnectionState::Disconnected {
            let was_connected = self.state.is_connected();
            info!("event channel closed by client");
            self.set_state(ConnectionState::Disconnected);
            if was_connected {
                self.dispatch(&ChannelEvent::Disconnected {
                    reason: "client disconnect".into(),
                });
            }
        }
    }

    /// Register `handler` for events named `event`. Handlers of one name run in
    /// registration order.
    pub fn subscribe<F>(&mut self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: FnMut(&ChannelEvent) -> Result<(), HandlerError> + Send + 'static,
    {
        let id = Uuid::new_v4();
        self.subscribers
            .entry(event.into())
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Remove a subscription, returning whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for handlers in self.subscribers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(existing, _)| *existing != id);
            removed |= handlers.len() != before;
        }
        removed
    }

    /// Surface an error detected outside the channel (e.g. a rejected snapshot) to
    /// `error` subscribers.
    pub fn report(&mut self, error: ChannelError) {
        self.dispatch(&ChannelEvent::Error(error));
    }

    /// Wait for the next event, apply it and dispatch it to subscribers.
    ///
    /// Stale signals from a cancelled supervisor are dropped. Never completes while
    /// the channel is idle, which makes it suitable as a `tokio::select!` branch.
    /// Cancel safe.
    ///
    /// Must be driven while connected: once the signal queue is full the supervisor
    /// stops reading from the transport until events are consumed.
    pub async fn recv(&mut self) -> ChannelEvent {
        loop {
            let Some(signal) = self.signal_rx.recv().await else {
                // The manager keeps a sender alive, so the queue never closes.
                return std::future::pending().await;
            };
            if signal.epoch != self.epoch {
                debug!(event = signal.event.name(), "dropping stale channel signal");
                continue;
            }

            if let ChannelEvent::StateChanged(state) = signal.event {
                self.set_state(state);
            } else {
                self.dispatch(&signal.event);
            }
            return signal.event;
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "connection state changed");
        }
        self.state = state;
        self.state_tx.send_replace(state);
        self.dispatch(&ChannelEvent::StateChanged(state));
    }

    fn dispatch(&mut self, event: &ChannelEvent) {
        let name = event.name();
        let Some(handlers) = self.subscribers.get_mut(name) else {
            return;
        };

        for (id, handler) in handlers.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = name, subscription = %id, error = %err, "channel handler failed");
                }
                Err(_) => {
                    error!(event = name, subscription = %id, "channel handler panicked");
                }
            }
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

/// Background task owning the transport and the reconnection loop.
struct Supervisor {
    endpoint: String,
    options: ChannelOptions,
    connector: Arc<dyn Connector>,
    tx: mpsc::Sender<Signal>,
    epoch: u64,
}

impl Supervisor {
    async fn run(self) {
        let mut attempt: u32 = 0;

        loop {
            let cause = match self.open().await {
                Ok(mut transport) => {
                    self.emit(ChannelEvent::StateChanged(ConnectionState::Connected))
                        .await;
                    self.emit(ChannelEvent::Connected).await;
                    if attempt > 0 {
                        info!(attempts = attempt, "event channel reconnected");
                        self.emit(ChannelEvent::Reconnected { attempts: attempt })
                            .await;
                    }
                    attempt = 0;

                    let reason = self.pump(transport.as_mut()).await;
                    warn!(%reason, "event channel lost");
                    self.emit(ChannelEvent::Disconnected {
                        reason: reason.clone(),
                    })
                    .await;
                    reason
                }
                Err(err) => {
                    warn!(error = %err, attempt, "event channel connection failed");
                    self.emit(ChannelEvent::ConnectError {
                        message: err.to_string(),
                    })
                    .await;
                    err.to_string()
                }
            };

            if !self.options.reconnection {
                self.emit(ChannelEvent::StateChanged(ConnectionState::Disconnected))
                    .await;
                self.emit(ChannelEvent::Error(ChannelError::ConnectFailed(cause)))
                    .await;
                return;
            }

            attempt += 1;
            if !self.options.max_reconnection_attempts.allows(attempt) {
                let attempts = attempt - 1;
                error!(attempts, "giving up on the event channel");
                self.emit(ChannelEvent::StateChanged(ConnectionState::Disconnected))
                    .await;
                self.emit(ChannelEvent::Error(ChannelError::ReconnectExhausted {
                    attempts,
                }))
                .await;
                return;
            }

            let delay = self.options.backoff_delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnection");
            self.emit(ChannelEvent::StateChanged(ConnectionState::Reconnecting))
                .await;
            self.emit(ChannelEvent::ReconnectAttempt { attempt, delay }).await;
            sleep(delay).await;
        }
    }

    /// Try every preferred transport once, in order.
    async fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        let mut last_error = TransportError::NoTransport;
        let timeout_ms = self.options.connect_timeout.as_millis() as u64;

        for kind in &self.options.transports {
            let attempt = self.connector.connect(&self.endpoint, *kind);
            match timeout(self.options.connect_timeout, attempt).await {
                Ok(Ok(transport)) => {
                    info!(transport = kind.label(), endpoint = %self.endpoint, "transport established");
                    return Ok(transport);
                }
                Ok(Err(err)) => {
                    debug!(transport = kind.label(), error = %err, "transport failed to connect");
                    last_error = err;
                }
                Err(_) => {
                    debug!(transport = kind.label(), timeout_ms, "transport connect timed out");
                    last_error = TransportError::Timeout { timeout_ms };
                }
            }
        }

        Err(last_error)
    }

    /// Forward frames until the transport ends, returning why it ended.
    async fn pump(&self, transport: &mut dyn Transport) -> String {
        loop {
            match transport.next_frame().await {
                Ok(Some(text)) => match decode_frame(&text) {
                    Ok(message) => self.emit(ChannelEvent::Message(message)).await,
                    Err(err) => {
                        warn!(error = %err, "discarding malformed frame");
                        self.emit(ChannelEvent::Error(err)).await;
                    }
                },
                Ok(None) => return "transport closed".into(),
                Err(err) => return err.to_string(),
            }
        }
    }

    async fn emit(&self, event: ChannelEvent) {
        // A closed queue means the manager is gone and this task is being aborted.
        let _ = self
            .tx
            .send(Signal {
                epoch: self.epoch,
                event,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::services::transport::scripted::ScriptedConnector;

    fn options(max: ReconnectAttempts) -> ChannelOptions {
        ChannelOptions {
            transports: vec![TransportKind::Websocket],
            reconnection: true,
            max_reconnection_attempts: max,
            reconnection_delay: Duration::from_millis(1_000),
            reconnection_delay_max: Duration::from_millis(5_000),
            connect_timeout: Duration::from_millis(500),
        }
    }

    fn record<T: Send + 'static>(
        manager: &mut ChannelManager,
        event: &str,
        map: impl Fn(&ChannelEvent) -> Option<T> + Send + 'static,
    ) -> Arc<Mutex<Vec<T>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.subscribe(event, move |event| {
            if let Some(value) = map(event) {
                sink.lock().unwrap().push(value);
            }
            Ok(())
        });
        seen
    }

    fn record_states(manager: &mut ChannelManager) -> Arc<Mutex<Vec<ConnectionState>>> {
        record(manager, EVENT_STATE, |event| match event {
            ChannelEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
    }

    async fn recv_until(
        manager: &mut ChannelManager,
        done: impl Fn(&ChannelEvent) -> bool,
    ) -> ChannelEvent {
        loop {
            let event = manager.recv().await;
            if done(&event) {
                return event;
            }
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let options = options(ReconnectAttempts::Unbounded);
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| options.backoff_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000, 5_000]);
        assert_eq!(options.backoff_delay(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn starts_disconnected() {
        let manager = ChannelManager::new(Arc::new(ScriptedConnector::default()));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(*manager.state_watcher().borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_frames_in_order() {
        let connector = Arc::new(ScriptedConnector::default());
        let peer = connector.accept();
        let mut manager = ChannelManager::new(connector.clone());
        let timers = record(&mut manager, "timer", |event| match event {
            ChannelEvent::Message(InboundMessage::Timer(snapshot)) => {
                Some(snapshot.remaining_time)
            }
            _ => None,
        });

        manager.connect("ws://device/events", options(ReconnectAttempts::Unbounded));
        recv_until(&mut manager, |event| *event == ChannelEvent::Connected).await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        for remaining in [30, 29, 28] {
            peer.send(Ok(format!(
                r#"{{"event":"timer","data":{{"timestamp":1,"remaining_time":{remaining},"status":"playing"}}}}"#
            )))
            .unwrap();
        }
        for _ in 0..3 {
            recv_until(&mut manager, |event| event.name() == "timer").await;
        }

        assert_eq!(*timers.lock().unwrap(), vec![30.0, 29.0, 28.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_next_transport_after_timeout() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.hang();
        let _peer = connector.accept();
        let mut manager = ChannelManager::new(connector.clone());
        let mut options = options(ReconnectAttempts::Unbounded);
        options.transports = vec![TransportKind::Websocket, TransportKind::Polling];

        let started = tokio::time::Instant::now();
        manager.connect("ws://device/events", options);
        recv_until(&mut manager, |event| *event == ChannelEvent::Connected).await;

        assert_eq!(started.elapsed(), Duration::from_millis(500));
        assert_eq!(
            connector.kinds(),
            vec![TransportKind::Websocket, TransportKind::Polling]
        );
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn every_transport_timing_out_reports_timeout() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.hang();
        connector.hang();
        let mut manager = ChannelManager::new(connector.clone());
        let failures = record(&mut manager, EVENT_CONNECT_ERROR, |event| match event {
            ChannelEvent::ConnectError { message } => Some(message.clone()),
            _ => None,
        });
        let mut options = options(ReconnectAttempts::Unbounded);
        options.transports = vec![TransportKind::Websocket, TransportKind::Polling];
        options.reconnection = false;

        let started = tokio::time::Instant::now();
        manager.connect("ws://device/events", options);
        let event = recv_until(&mut manager, |event| event.name() == EVENT_ERROR).await;

        let expected = TransportError::Timeout { timeout_ms: 500 }.to_string();
        assert_eq!(started.elapsed(), Duration::from_millis(1_000));
        assert_eq!(*failures.lock().unwrap(), vec![expected.clone()]);
        assert_eq!(
            event,
            ChannelEvent::Error(ChannelError::ConnectFailed(expected))
        );
        assert_eq!(
            connector.kinds(),
            vec![TransportKind::Websocket, TransportKind::Polling]
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_beyond_queue_capacity_wait_for_the_owner() {
        let connector = Arc::new(ScriptedConnector::default());
        let peer = connector.accept();
        let mut manager = ChannelManager::new(connector.clone());
        let syncs = record(&mut manager, "sync", |event| match event {
            ChannelEvent::Message(InboundMessage::Sync { server_time }) => Some(*server_time),
            _ => None,
        });

        manager.connect("ws://device/events", options(ReconnectAttempts::Unbounded));
        recv_until(&mut manager, |event| *event == ChannelEvent::Connected).await;

        let total = SIGNAL_QUEUE_CAPACITY + 44;
        for n in 0..total {
            peer.send(Ok(format!(r#"{{"event":"sync","data":{{"server_time":{n}}}}}"#)))
                .unwrap();
        }
        // The supervisor parks on the full queue instead of dropping frames.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.signal_rx.len(), SIGNAL_QUEUE_CAPACITY);

        for _ in 0..total {
            recv_until(&mut manager, |event| event.name() == "sync").await;
        }
        let expected: Vec<f64> = (0..total).map(|n| n as f64).collect();
        assert_eq!(*syncs.lock().unwrap(), expected);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_after_drop() {
        let connector = Arc::new(ScriptedConnector::default());
        let peer = connector.accept();
        connector.refuse("device rebooting");
        connector.refuse("device rebooting");
        let _second_peer = connector.accept();

        let mut manager = ChannelManager::new(connector.clone());
        let states = record_states(&mut manager);
        let delays = record(&mut manager, EVENT_RECONNECT_ATTEMPT, |event| match event {
            ChannelEvent::ReconnectAttempt { delay, .. } => Some(*delay),
            _ => None,
        });

        manager.connect("ws://device/events", options(ReconnectAttempts::Limited(5)));
        recv_until(&mut manager, |event| *event == ChannelEvent::Connected).await;

        drop(peer);
        let event = recv_until(&mut manager, |event| {
            matches!(event, ChannelEvent::Reconnected { .. })
        })
        .await;

        assert_eq!(event, ChannelEvent::Reconnected { attempts: 3 });
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(
            *delays.lock().unwrap(),
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(2_000),
                Duration::from_millis(4_000),
            ]
        );
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.refuse("down");
        connector.refuse("down");
        connector.refuse("down");

        let mut manager = ChannelManager::new(connector.clone());
        let errors = record(&mut manager, EVENT_ERROR, |event| match event {
            ChannelEvent::Error(err) => Some(err.clone()),
            _ => None,
        });

        manager.connect("ws://device/events", options(ReconnectAttempts::Limited(2)));
        recv_until(&mut manager, |event| event.name() == EVENT_ERROR).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            *errors.lock().unwrap(),
            vec![ChannelError::ReconnectExhausted { attempts: 2 }]
        );
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn no_reconnection_means_terminal_failure() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.refuse("refused");

        let mut manager = ChannelManager::new(connector.clone());
        let states = record_states(&mut manager);
        let mut options = options(ReconnectAttempts::Unbounded);
        options.reconnection = false;

        manager.connect("ws://device/events", options);
        let event = recv_until(&mut manager, |event| event.name() == EVENT_ERROR).await;

        assert!(matches!(
            event,
            ChannelEvent::Error(ChannelError::ConnectFailed(_))
        ));
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnection() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.refuse("down");

        let mut manager = ChannelManager::new(connector.clone());
        let states = record_states(&mut manager);
        manager.connect("ws://device/events", options(ReconnectAttempts::Unbounded));
        recv_until(&mut manager, |event| event.name() == EVENT_RECONNECT_ATTEMPT).await;

        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let quiet = tokio::time::timeout(Duration::from_secs(60), manager.recv()).await;
        assert!(quiet.is_err(), "no event may follow a disconnect");
        assert_eq!(connector.attempts(), 1);
        assert_eq!(
            states
                .lock()
                .unwrap()
                .iter()
                .filter(|state| **state == ConnectionState::Disconnected)
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frames_queued_before_disconnect_are_dropped() {
        let connector = Arc::new(ScriptedConnector::default());
        let peer = connector.accept();
        let mut manager = ChannelManager::new(connector.clone());
        let syncs = record(&mut manager, "sync", |_| Some(()));

        manager.connect("ws://device/events", options(ReconnectAttempts::Unbounded));
        recv_until(&mut manager, |event| *event == ChannelEvent::Connected).await;

        peer.send(Ok(r#"{"event":"sync","data":{"server_time":5.0}}"#.into()))
            .unwrap();
        // Let the supervisor forward the frame before cancelling it.
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.disconnect();

        let quiet = tokio::time::timeout(Duration::from_secs(5), manager.recv()).await;
        assert!(quiet.is_err());
        assert!(syncs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_reported_and_skipped() {
        let connector = Arc::new(ScriptedConnector::default());
        let peer = connector.accept();
        let mut manager = ChannelManager::new(connector.clone());
        let errors = record(&mut manager, EVENT_ERROR, |_| Some(()));

        manager.connect("ws://device/events", options(ReconnectAttempts::Unbounded));
        recv_until(&mut manager, |event| *event == ChannelEvent::Connected).await;

        peer.send(Ok("{oops".into())).unwrap();
        peer.send(Ok(r#"{"event":"game","data":"created"}"#.into()))
            .unwrap();
        recv_until(&mut manager, |event| event.name() == "game").await;

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn wrapped_handler_errors_keep_their_cause() {
        let mut manager = ChannelManager::new(Arc::new(ScriptedConnector::default()));
        let causes = Arc::new(Mutex::new(Vec::new()));

        let sink = causes.clone();
        manager.subscribe(EVENT_ERROR, move |_| {
            let decoded = serde_json::from_str::<serde_json::Value>("{\"truncated\":")
                .map_err(|err| HandlerError::wrap("bad payload", err));
            if let Err(err) = &decoded {
                let cause = std::error::Error::source(err).map(ToString::to_string);
                sink.lock().unwrap().push((err.to_string(), cause));
            }
            decoded.map(|_| ())
        });
        let after = record(&mut manager, EVENT_ERROR, |_| Some(()));

        manager.report(ChannelError::ReconnectExhausted { attempts: 1 });

        let causes = causes.lock().unwrap();
        assert_eq!(causes.len(), 1);
        assert_eq!(causes[0].0, "handler failed: bad payload");
        assert!(causes[0].1.as_deref().is_some_and(|cause| cause.contains("EOF")));
        assert_eq!(after.lock().unwrap().len(), 1);
    }

    #[test]
    fn failing_handlers_do_not_stop_dispatch() {
        let mut manager = ChannelManager::new(Arc::new(ScriptedConnector::default()));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let sink = calls.clone();
        manager.subscribe(EVENT_ERROR, move |_| {
            sink.lock().unwrap().push("first");
            Err(HandlerError::msg("boom"))
        });
        let sink = calls.clone();
        manager.subscribe(EVENT_ERROR, move |_| {
            sink.lock().unwrap().push("second");
            panic!("handler bug");
        });
        let sink = calls.clone();
        let third = manager.subscribe(EVENT_ERROR, move |_| {
            sink.lock().unwrap().push("third");
            Ok(())
        });

        manager.report(ChannelError::ReconnectExhausted { attempts: 1 });
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);

        assert!(manager.unsubscribe(third));
        assert!(!manager.unsubscribe(third));
        calls.lock().unwrap().clear();
        manager.report(ChannelError::ReconnectExhausted { attempts: 1 });
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }
}
