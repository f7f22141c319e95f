//! Runtime configuration: endpoints, reconnection policy, countdown tuning.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};
use validator::{Validate, ValidationError};

use crate::{
    dao::http::HttpSourceConfig,
    services::{
        channel::{ChannelOptions, ReconnectAttempts},
        transport::TransportKind,
    },
    state::timer::{TimerDefaults, TimerSettings},
};

/// Default location on disk where the client looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/timer.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "CUE_TIMER_CONFIG_PATH";
/// Environment variable overriding the push channel endpoint.
const CHANNEL_URL_ENV: &str = "CUE_TIMER_CHANNEL_URL";
/// Environment variable overriding the REST API base URL.
const API_URL_ENV: &str = "CUE_TIMER_API_URL";

const DEFAULT_CHANNEL_URL: &str = "ws://127.0.0.1:5000/events";
const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/api";

#[derive(Debug, Clone, PartialEq)]
/// Immutable runtime configuration.
pub struct AppConfig {
    /// Endpoint of the push channel.
    pub channel_url: String,
    /// Base URL of the game/ruleset REST API.
    pub api_url: String,
    /// Options handed to the channel manager.
    pub channel: ChannelOptions,
    /// Pace of the HTTP polling fallback.
    pub poll_interval: Duration,
    /// Countdown tuning.
    pub timer: TimerSettings,
    /// Timeout of REST requests.
    pub request_timeout: Duration,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults, then apply
    /// environment overrides.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let config = match fs::read_to_string(&path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded timer config");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "invalid config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };

        config.with_overrides(env::var(CHANNEL_URL_ENV).ok(), env::var(API_URL_ENV).ok())
    }

    /// Parse and validate a JSON document.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let raw = serde_json::from_str::<RawConfig>(contents)?;
        raw.validate()?;
        Ok(raw.into())
    }

    /// Settings for the HTTP session source.
    pub fn http_source(&self) -> HttpSourceConfig {
        HttpSourceConfig::new(self.api_url.clone()).with_timeout(self.request_timeout)
    }

    fn with_overrides(mut self, channel_url: Option<String>, api_url: Option<String>) -> Self {
        if let Some(url) = channel_url.filter(|url| !url.is_empty()) {
            info!(%url, "channel endpoint overridden from environment");
            self.channel_url = url;
        }
        if let Some(url) = api_url.filter(|url| !url.is_empty()) {
            info!(%url, "API endpoint overridden from environment");
            self.api_url = url;
        }
        self
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

/// Why a configuration document was rejected.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Not JSON, or not the expected shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// Well-formed but out of range.
    #[error("invalid config: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

#[derive(Debug, Deserialize, Validate)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    #[validate(url)]
    channel_url: String,
    #[validate(url)]
    api_url: String,
    #[validate(nested)]
    channel: RawChannel,
    #[validate(nested)]
    timer: RawTimer,
    #[validate(nested)]
    http: RawHttp,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            channel_url: DEFAULT_CHANNEL_URL.into(),
            api_url: DEFAULT_API_URL.into(),
            channel: RawChannel::default(),
            timer: RawTimer::default(),
            http: RawHttp::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_backoff"))]
struct RawChannel {
    #[validate(length(min = 1))]
    transports: Vec<TransportKind>,
    reconnection: bool,
    /// `null` or absent means unbounded.
    max_reconnection_attempts: Option<u32>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "reconnection_delay_ms")]
    #[validate(custom(function = "non_zero"))]
    reconnection_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "reconnection_delay_max_ms")]
    reconnection_delay_max: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "connect_timeout_ms")]
    #[validate(custom(function = "non_zero"))]
    connect_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    #[validate(custom(function = "non_zero"))]
    poll_interval: Duration,
}

impl Default for RawChannel {
    fn default() -> Self {
        let options = ChannelOptions::default();
        Self {
            transports: options.transports,
            reconnection: options.reconnection,
            max_reconnection_attempts: None,
            reconnection_delay: options.reconnection_delay,
            reconnection_delay_max: options.reconnection_delay_max,
            connect_timeout: options.connect_timeout,
            poll_interval: Duration::from_millis(1_000),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Validate)]
#[serde(default)]
struct RawTimer {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "tick_period_ms")]
    #[validate(custom(function = "non_zero"))]
    tick_period: Duration,
    #[validate(range(min = 0.0))]
    default_duration_secs: f64,
    #[validate(range(min = 0.0))]
    idle_remaining_secs: f64,
    #[validate(range(min = 0.0))]
    default_alarm_secs: f64,
}

impl Default for RawTimer {
    fn default() -> Self {
        let settings = TimerSettings::default();
        Self {
            tick_period: settings.tick_period,
            default_duration_secs: settings.defaults.initial_duration,
            idle_remaining_secs: settings.idle_remaining,
            default_alarm_secs: settings.defaults.alarm_time,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Validate)]
#[serde(default)]
struct RawHttp {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "request_timeout_ms")]
    #[validate(custom(function = "non_zero"))]
    request_timeout: Duration,
}

impl Default for RawHttp {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(5_000),
        }
    }
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let RawConfig {
            channel_url,
            api_url,
            channel,
            timer,
            http,
        } = value;

        let max_reconnection_attempts = channel
            .max_reconnection_attempts
            .map_or(ReconnectAttempts::Unbounded, ReconnectAttempts::Limited);

        Self {
            channel_url,
            api_url,
            channel: ChannelOptions {
                transports: channel.transports,
                reconnection: channel.reconnection,
                max_reconnection_attempts,
                reconnection_delay: channel.reconnection_delay,
                reconnection_delay_max: channel.reconnection_delay_max,
                connect_timeout: channel.connect_timeout,
            },
            poll_interval: channel.poll_interval,
            timer: TimerSettings {
                tick_period: timer.tick_period,
                defaults: TimerDefaults {
                    initial_duration: timer.default_duration_secs,
                    alarm_time: timer.default_alarm_secs,
                },
                idle_remaining: timer.idle_remaining_secs,
            },
            request_timeout: http.request_timeout,
        }
    }
}

fn non_zero(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        let mut err = ValidationError::new("zero_duration");
        err.message = Some("duration must be greater than zero".into());
        return Err(err);
    }
    Ok(())
}

fn validate_backoff(channel: &RawChannel) -> Result<(), ValidationError> {
    if channel.reconnection_delay_max < channel.reconnection_delay {
        let mut err = ValidationError::new("backoff_cap");
        err.message = Some(
            format!(
                "reconnection_delay_max_ms ({}) is below reconnection_delay_ms ({})",
                channel.reconnection_delay_max.as_millis(),
                channel.reconnection_delay.as_millis()
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.channel_url, "ws://127.0.0.1:5000/events");
        assert_eq!(config.api_url, "http://127.0.0.1:5000/api");
        assert_eq!(
            config.channel.transports,
            vec![TransportKind::Websocket, TransportKind::Polling]
        );
        assert!(config.channel.reconnection);
        assert_eq!(
            config.channel.max_reconnection_attempts,
            ReconnectAttempts::Unbounded
        );
        assert_eq!(config.channel.reconnection_delay, Duration::from_millis(1_000));
        assert_eq!(config.channel.reconnection_delay_max, Duration::from_millis(5_000));
        assert_eq!(config.channel.connect_timeout, Duration::from_millis(20_000));
        assert_eq!(config.timer, TimerSettings::default());
        assert_eq!(config.request_timeout, Duration::from_millis(5_000));
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = AppConfig::parse(
            r#"{
                "channel_url": "wss://device.local/events",
                "channel": { "transports": ["polling"], "max_reconnection_attempts": 3 },
                "timer": { "tick_period_ms": 100, "default_alarm_secs": 20 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.channel_url, "wss://device.local/events");
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.channel.transports, vec![TransportKind::Polling]);
        assert_eq!(
            config.channel.max_reconnection_attempts,
            ReconnectAttempts::Limited(3)
        );
        assert_eq!(config.timer.tick_period, Duration::from_millis(100));
        assert_eq!(config.timer.defaults.alarm_time, 20.0);
        assert_eq!(config.timer.defaults.initial_duration, 60.0);
    }

    #[test]
    fn null_attempts_means_unbounded() {
        let config =
            AppConfig::parse(r#"{ "channel": { "max_reconnection_attempts": null } }"#).unwrap();
        assert_eq!(
            config.channel.max_reconnection_attempts,
            ReconnectAttempts::Unbounded
        );
    }

    #[test]
    fn rejects_invalid_values() {
        for document in [
            r#"{ "channel_url": "not a url" }"#,
            r#"{ "channel": { "transports": [] } }"#,
            r#"{ "channel": { "reconnection_delay_ms": 0 } }"#,
            r#"{ "channel": { "reconnection_delay_ms": 3000, "reconnection_delay_max_ms": 1000 } }"#,
            r#"{ "timer": { "default_duration_secs": -5 } }"#,
        ] {
            assert!(
                matches!(AppConfig::parse(document), Err(ConfigError::Invalid(_))),
                "accepted {document}"
            );
        }
        assert!(matches!(
            AppConfig::parse(r#"{ "channel": { "transports": ["carrier-pigeon"] } }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_endpoints() {
        let config = AppConfig::default().with_overrides(
            Some("ws://10.0.0.2:5000/events".into()),
            Some(String::new()),
        );
        assert_eq!(config.channel_url, "ws://10.0.0.2:5000/events");
        assert_eq!(config.api_url, DEFAULT_API_URL);
    }
}
