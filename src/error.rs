use std::error::Error;

use thiserror::Error;

/// Reasons a timer snapshot is discarded instead of being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SnapshotError {
    /// The authoritative timestamp is NaN or infinite.
    #[error("snapshot timestamp is not a finite number ({0})")]
    NonFiniteTimestamp(f64),
    /// The remaining time is NaN or infinite.
    #[error("snapshot remaining time is not a finite number ({0})")]
    NonFiniteRemaining(f64),
}

/// Failures raised by a single transport while connecting or reading frames.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection was not established within the configured timeout.
    #[error("connection attempt timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// The transport could not reach the endpoint.
    #[error("failed to connect to `{endpoint}`: {message}")]
    Connect { endpoint: String, message: String },
    /// The transport dropped while reading frames.
    #[error("transport read failed: {0}")]
    Read(String),
    /// The endpoint URL cannot be used by this transport.
    #[error("endpoint `{endpoint}` is not usable for {transport}")]
    InvalidEndpoint {
        endpoint: String,
        transport: &'static str,
    },
    /// None of the preferred transports is compiled in.
    #[error("no usable transport configured")]
    NoTransport,
}

/// Errors surfaced to channel subscribers through the `error` event.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    /// Reconnection gave up; the connection stays down until `connect` is called again.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    /// Initial connection failed and reconnection is disabled.
    #[error("connection failed and reconnection is disabled: {0}")]
    ConnectFailed(String),
    /// A frame could not be decoded.
    #[error("malformed `{event}` frame: {message}")]
    MalformedFrame { event: String, message: String },
    /// A timer snapshot was rejected.
    #[error("rejected timer snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Error returned by a subscriber callback.
///
/// Handler failures are logged by the channel manager and never stop dispatch to the
/// remaining subscribers.
#[derive(Debug, Error)]
#[error("handler failed: {message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl HandlerError {
    /// Build a handler error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap any error raised inside a handler.
    pub fn wrap(message: impl Into<String>, source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Errors raised while loading session data from the external collaborators.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The collaborator reports that no session is in progress.
    #[error("no game in progress")]
    NoSession,
    /// The session references a ruleset the collaborator does not know.
    #[error("ruleset `{0}` not found")]
    RulesetNotFound(i64),
    /// The session document carries no ruleset reference.
    #[error("session has no ruleset")]
    MissingRuleset,
    /// The collaborator could not be reached or answered garbage.
    #[error("session source unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl SessionError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: String, source: impl Error + Send + Sync + 'static) -> Self {
        SessionError::Unavailable {
            message,
            source: Box::new(source),
        }
    }
}

/// Result alias for session lookups.
pub type SessionResult<T> = Result<T, SessionError>;
