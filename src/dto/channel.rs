//! Frames pushed by the authoritative source over the event channel.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::{
    error::ChannelError,
    state::timer::{SnapshotStatus, TimerSnapshot},
};

/// Event name of clock calibration frames.
pub const EVENT_SYNC: &str = "sync";
/// Legacy name still emitted by older devices for [`EVENT_SYNC`].
pub const EVENT_TIME_SYNC: &str = "time_sync";
/// Event name of countdown snapshots.
pub const EVENT_TIMER: &str = "timer";
/// Event name of session lifecycle notifications.
pub const EVENT_GAME: &str = "game";

#[derive(Debug, Clone, Deserialize)]
/// Raw envelope read from a transport.
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
/// Payload of a `sync` frame.
pub struct SyncPayload {
    pub server_time: f64,
}

#[derive(Debug, Deserialize)]
/// Payload of a `timer` frame.
///
/// Numeric fields that are missing, `null` or not parseable decode to NaN so the
/// reconciler can reject the snapshot as a whole.
pub struct TimerPayload {
    #[serde(default = "nan", deserialize_with = "lenient_number")]
    pub timestamp: f64,
    #[serde(default = "nan", deserialize_with = "lenient_number")]
    pub remaining_time: f64,
    pub status: WireTimerStatus,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Status string carried by `timer` frames.
pub enum WireTimerStatus {
    Playing,
    Paused,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
/// Payload of a `game` frame, either `"created"` or `{"event": "created"}`.
enum GamePayload {
    Bare(String),
    Tagged { event: String },
}

/// Session lifecycle notification carried by `game` frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLifecycle {
    /// A new session was created on the device.
    Created,
    /// The current session ended.
    Ended,
    /// Any other notification; ignored by the coordinator.
    Other(String),
}

impl From<String> for SessionLifecycle {
    fn from(value: String) -> Self {
        match value.as_str() {
            "created" => SessionLifecycle::Created,
            "ended" => SessionLifecycle::Ended,
            _ => SessionLifecycle::Other(value),
        }
    }
}

/// Typed content of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Server clock reading for offset calibration.
    Sync { server_time: f64 },
    /// Authoritative countdown snapshot (not yet validated).
    Timer(TimerSnapshot),
    /// Session lifecycle notification.
    Session(SessionLifecycle),
    /// Frame the engine does not interpret; still delivered to subscribers.
    Other { event: String, data: Value },
}

impl InboundMessage {
    /// Name subscribers use to register for this message.
    pub fn event_name(&self) -> &str {
        match self {
            InboundMessage::Sync { .. } => EVENT_SYNC,
            InboundMessage::Timer(_) => EVENT_TIMER,
            InboundMessage::Session(_) => EVENT_GAME,
            InboundMessage::Other { event, .. } => event,
        }
    }
}

/// Decode a text frame into a typed message.
pub fn decode_frame(text: &str) -> Result<InboundMessage, ChannelError> {
    let frame: Frame = serde_json::from_str(text).map_err(|err| ChannelError::MalformedFrame {
        event: "<unknown>".into(),
        message: err.to_string(),
    })?;
    decode(frame)
}

/// Interpret an already parsed envelope.
pub fn decode(frame: Frame) -> Result<InboundMessage, ChannelError> {
    let Frame { event, data } = frame;
    let malformed = |err: serde_json::Error| ChannelError::MalformedFrame {
        event: event.clone(),
        message: err.to_string(),
    };

    match event.as_str() {
        EVENT_SYNC | EVENT_TIME_SYNC => {
            let payload: SyncPayload = serde_json::from_value(data).map_err(malformed)?;
            Ok(InboundMessage::Sync {
                server_time: payload.server_time,
            })
        }
        EVENT_TIMER => {
            let payload: TimerPayload = serde_json::from_value(data).map_err(malformed)?;
            Ok(InboundMessage::Timer(payload.into()))
        }
        EVENT_GAME => {
            let payload: GamePayload = serde_json::from_value(data).map_err(malformed)?;
            let name = match payload {
                GamePayload::Bare(name) | GamePayload::Tagged { event: name } => name,
            };
            Ok(InboundMessage::Session(name.into()))
        }
        _ => Ok(InboundMessage::Other { event, data }),
    }
}

impl From<TimerPayload> for TimerSnapshot {
    fn from(value: TimerPayload) -> Self {
        Self {
            server_timestamp: value.timestamp,
            remaining_time: value.remaining_time,
            status: value.status.into(),
        }
    }
}

impl From<WireTimerStatus> for SnapshotStatus {
    fn from(value: WireTimerStatus) -> Self {
        match value {
            WireTimerStatus::Playing => SnapshotStatus::Playing,
            WireTimerStatus::Paused => SnapshotStatus::Paused,
        }
    }
}

fn nan() -> f64 {
    f64::NAN
}

fn lenient_number<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    })
}
