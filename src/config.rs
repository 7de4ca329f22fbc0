// src/config.rs

use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use log::info;

use crate::error::ConfigError;
use crate::models::{AlertRepeatPolicy, MonitorConfig};

pub const DEFAULT_FEED_BASE_URL: &str = "https://api.thingspeak.com";

// Cadence of the poll loop
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(7_500);

// Must stay below the poll interval so two requests never overlap
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);

pub const DEFAULT_ANCHOR_FILE: &str = "./anchor.csv";

pub const DEFAULT_THRESHOLD_METERS: f64 = 50.0;

/// The feed stamps samples in UTC while its consumers expect US Eastern
/// daylight time, so timestamps are re-expressed at UTC-4.
pub const DEFAULT_FEED_UTC_OFFSET_HOURS: i32 = -4;

// Events waiting for the display and notification sinks
pub const SINK_QUEUE_CAPACITY: usize = 64;

/// Everything needed to run one watcher
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub feed_base_url: String,
    pub channel_id: String,
    pub read_api_key: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub anchor_file: PathBuf,
    pub monitor: MonitorConfig,
    pub repeat_policy: AlertRepeatPolicy,
    pub feed_utc_offset: FixedOffset,
}

impl WatchConfig {
    /// A config with defaults for everything but the channel
    pub fn for_channel(channel_id: impl Into<String>) -> Self {
        Self {
            feed_base_url: DEFAULT_FEED_BASE_URL.to_string(),
            channel_id: channel_id.into(),
            read_api_key: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            anchor_file: PathBuf::from(DEFAULT_ANCHOR_FILE),
            monitor: MonitorConfig::default(),
            repeat_policy: AlertRepeatPolicy::default(),
            feed_utc_offset: default_feed_utc_offset(),
        }
    }

    /// Reads environment variables and builds the watcher config.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let channel_id = lookup("THINGSPEAK_CHANNEL_ID")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("THINGSPEAK_CHANNEL_ID"))?;
        let mut config = Self::for_channel(channel_id.trim());

        if let Some(url) = lookup("THINGSPEAK_BASE_URL") {
            config.feed_base_url = url.trim().trim_end_matches('/').to_string();
        }
        config.read_api_key = lookup("THINGSPEAK_READ_API_KEY").filter(|v| !v.trim().is_empty());

        if let Some(ms) = lookup("POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(parse_number("POLL_INTERVAL_MS", &ms)?);
        }
        if let Some(ms) = lookup("REQUEST_TIMEOUT_MS") {
            config.request_timeout =
                Duration::from_millis(parse_number("REQUEST_TIMEOUT_MS", &ms)?);
        }
        if let Some(path) = lookup("ANCHOR_FILE") {
            config.anchor_file = PathBuf::from(path.trim());
        }

        let threshold = match lookup("THRESHOLD_METERS") {
            Some(v) => parse_number::<f64>("THRESHOLD_METERS", &v)?,
            None => DEFAULT_THRESHOLD_METERS,
        };
        let armed = match lookup("MONITOR_ARMED") {
            Some(v) => parse_bool("MONITOR_ARMED", &v)?,
            None => false,
        };
        config.monitor = MonitorConfig::new(armed, threshold).map_err(|e| ConfigError::Invalid {
            key: "THRESHOLD_METERS",
            reason: e.to_string(),
        })?;

        if let Some(policy) = lookup("ALERT_REPEAT_POLICY") {
            config.repeat_policy = policy.parse().map_err(|reason| ConfigError::Invalid {
                key: "ALERT_REPEAT_POLICY",
                reason,
            })?;
        }
        if let Some(hours) = lookup("FEED_UTC_OFFSET_HOURS") {
            let hours: i32 = parse_number("FEED_UTC_OFFSET_HOURS", &hours)?;
            config.feed_utc_offset = hours
                .checked_mul(3600)
                .and_then(FixedOffset::east_opt)
                .ok_or_else(|| ConfigError::Invalid {
                    key: "FEED_UTC_OFFSET_HOURS",
                    reason: format!("{} hours is not a valid UTC offset", hours),
                })?;
        }

        config.validate()?;

        info!(
            "Watch config: channel={}, base_url={}, api_key={}, interval={:?}, timeout={:?}, anchor_file={}, armed={}, threshold={:.2}m, policy={:?}, feed_offset={}",
            config.channel_id,
            config.feed_base_url,
            if config.read_api_key.is_some() { "[hidden]" } else { "none" },
            config.poll_interval,
            config.request_timeout,
            config.anchor_file.display(),
            config.monitor.armed(),
            config.monitor.threshold_meters(),
            config.repeat_policy,
            config.feed_utc_offset
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "POLL_INTERVAL_MS",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.request_timeout.is_zero() || self.request_timeout >= self.poll_interval {
            return Err(ConfigError::Invalid {
                key: "REQUEST_TIMEOUT_MS",
                reason: format!(
                    "{:?} must be non-zero and shorter than the poll interval {:?}",
                    self.request_timeout, self.poll_interval
                ),
            });
        }
        if url::Url::parse(&self.feed_base_url).is_err() {
            return Err(ConfigError::Invalid {
                key: "THINGSPEAK_BASE_URL",
                reason: format!("{:?} is not a valid URL", self.feed_base_url),
            });
        }
        Ok(())
    }
}

pub fn default_feed_utc_offset() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_FEED_UTC_OFFSET_HOURS * 3600).unwrap_or_else(|| Utc.fix())
}

fn parse_number<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: format!("{:?}: {}", raw, e),
    })
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key,
            reason: format!("{:?} is not a boolean", other),
        }),
    }
}
