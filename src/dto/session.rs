use serde::Deserialize;
use serde_json::{Map, Value};

use crate::state::timer::TimerDefaults;

/// Message the device answers with when no game is running.
pub const NO_GAME_MESSAGE: &str = "No game in progress";

#[derive(Debug, Clone, Deserialize, PartialEq)]
/// Current game document as returned by `GET /game`.
pub struct GameDocument {
    #[serde(default)]
    pub ruleset_id: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    /// Remaining fields of the device document, kept opaque.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GameDocument {
    /// Whether the document is the device's "no game" placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.message.as_deref() == Some(NO_GAME_MESSAGE)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
/// Ruleset document as returned by `GET /ruleset`.
pub struct RulesetDocument {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub initial_duration: f64,
    #[serde(default)]
    pub turn_duration: Option<f64>,
    #[serde(alias = "alarm_time")]
    pub allarm_time: f64,
    #[serde(default)]
    pub increment_duration: Option<f64>,
    #[serde(default)]
    pub max_increment_for_match: Option<f64>,
}

/// Session metadata seeding the countdown defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSummary {
    /// Ruleset the session plays under.
    pub ruleset_id: i64,
    /// Starting countdown in seconds.
    pub initial_duration: f64,
    /// Alarm threshold in seconds.
    pub alarm_time: f64,
}

impl From<&RulesetDocument> for SessionSummary {
    fn from(ruleset: &RulesetDocument) -> Self {
        Self {
            ruleset_id: ruleset.id,
            initial_duration: ruleset.initial_duration,
            alarm_time: ruleset.allarm_time,
        }
    }
}

impl From<SessionSummary> for TimerDefaults {
    fn from(summary: SessionSummary) -> Self {
        Self {
            initial_duration: summary.initial_duration,
            alarm_time: summary.alarm_time,
        }
    }
}
