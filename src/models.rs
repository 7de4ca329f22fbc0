// src/models.rs

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_THRESHOLD_METERS;
use crate::error::ValidationError;
use crate::geo::{HasLatLon, LatLon};
use crate::threshold;

//------------------------------------------------------------------------------
// POSITIONS
//------------------------------------------------------------------------------

/// One timestamped observation of the tracked object
///
/// Fields are private so a sample cannot be altered after it has been
/// handed to the watcher or written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    timestamp: DateTime<FixedOffset>,

    /// Degrees, [-90, 90]
    latitude: f64,

    /// Degrees, [-180, 180]
    longitude: f64,

    /// Meters, when the feed reports one
    altitude: Option<f64>,
}

impl PositionSample {
    pub fn new(
        timestamp: DateTime<FixedOffset>,
        latitude: f64,
        longitude: f64,
        altitude: Option<f64>,
    ) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            altitude,
        }
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn altitude(&self) -> Option<f64> {
        self.altitude
    }

    /// Lat/lon with six decimals, the precision shown to users
    pub fn display_coordinates(&self) -> String {
        format!("{:.6}, {:.6}", self.latitude, self.longitude)
    }

    pub fn display_altitude(&self) -> String {
        match self.altitude {
            Some(alt) => format!("{:.2} m", alt),
            None => "n/a".to_string(),
        }
    }
}

impl HasLatLon for PositionSample {
    fn lat_lon(&self) -> LatLon {
        LatLon::new(self.latitude, self.longitude)
    }
}

/// True when both values are finite and inside the degree ranges
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// The reference position movement is measured against
///
/// Only produced by an explicit save of the current sample or by reading
/// the anchor file back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Anchor(PositionSample);

impl Anchor {
    pub fn from_sample(sample: PositionSample) -> Self {
        Anchor(sample)
    }

    pub fn sample(&self) -> &PositionSample {
        &self.0
    }
}

impl Deref for Anchor {
    type Target = PositionSample;

    fn deref(&self) -> &PositionSample {
        &self.0
    }
}

impl HasLatLon for Anchor {
    fn lat_lon(&self) -> LatLon {
        self.0.lat_lon()
    }
}

//------------------------------------------------------------------------------
// MONITORING
//------------------------------------------------------------------------------

/// Whether monitoring is armed and how far the object may drift
///
/// Deserialization goes through the same threshold validation as the
/// setters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MonitorConfigFields")]
pub struct MonitorConfig {
    armed: bool,
    threshold_meters: f64,
}

#[derive(Deserialize)]
struct MonitorConfigFields {
    armed: bool,
    threshold_meters: f64,
}

impl TryFrom<MonitorConfigFields> for MonitorConfig {
    type Error = ValidationError;

    fn try_from(fields: MonitorConfigFields) -> Result<Self, Self::Error> {
        MonitorConfig::new(fields.armed, fields.threshold_meters)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            armed: false,
            threshold_meters: DEFAULT_THRESHOLD_METERS,
        }
    }
}

impl MonitorConfig {
    pub fn new(armed: bool, threshold_meters: f64) -> Result<Self, ValidationError> {
        let mut config = Self {
            armed,
            ..Self::default()
        };
        config.set_threshold_meters(threshold_meters)?;
        Ok(config)
    }

    pub fn armed(&self) -> bool {
        self.armed
    }

    pub fn threshold_meters(&self) -> f64 {
        self.threshold_meters
    }

    /// Threshold in the degree unit the control and text field work in
    pub fn threshold_degrees(&self) -> f64 {
        crate::geo::meters_to_degrees(self.threshold_meters)
    }

    pub fn set_armed(&mut self, armed: bool) {
        self.armed = armed;
    }

    pub fn set_threshold_meters(&mut self, meters: f64) -> Result<(), ValidationError> {
        self.threshold_meters = threshold::validate_meters(meters)?;
        Ok(())
    }

    pub fn set_threshold_degrees(&mut self, degrees: f64) -> Result<(), ValidationError> {
        let degrees = threshold::validate_degrees(degrees)?;
        self.threshold_meters = crate::geo::degrees_to_meters(degrees);
        Ok(())
    }

    /// Set the threshold from a normalized control position in [0, 1]
    pub fn set_threshold_from_control(&mut self, position: f64) {
        let degrees = threshold::control_to_threshold(position);
        self.threshold_meters = crate::geo::degrees_to_meters(degrees);
    }

    /// Normalized control position for the current threshold
    pub fn control_position(&self) -> f64 {
        // The stored value is always in range, the fallback only covers
        // rounding at the very edges of the meter conversion.
        threshold::threshold_to_control(self.threshold_degrees()).unwrap_or_else(|_| {
            if self.threshold_degrees() <= threshold::MIN_THRESHOLD_DEGREES {
                0.0
            } else {
                1.0
            }
        })
    }
}

/// What to do when the object stays beyond the threshold for several cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertRepeatPolicy {
    /// Alert on every poll cycle that exceeds the threshold
    EveryCycle,

    /// Alert once, then stay quiet until the anchor changes or monitoring
    /// is re-armed
    #[default]
    OncePerAnchor,

    /// Alert again once the cooldown has elapsed since the previous alert
    Cooldown(Duration),
}

impl FromStr for AlertRepeatPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "every" | "every_cycle" => Ok(AlertRepeatPolicy::EveryCycle),
            "once" | "once_per_anchor" => Ok(AlertRepeatPolicy::OncePerAnchor),
            _ => match s.strip_prefix("cooldown:") {
                Some(secs) => secs
                    .trim()
                    .parse::<u64>()
                    .map(|secs| AlertRepeatPolicy::Cooldown(Duration::from_secs(secs)))
                    .map_err(|e| format!("invalid cooldown seconds {:?}: {}", secs, e)),
                None => Err(format!(
                    "unknown alert repeat policy {:?} (expected once, every or cooldown:<secs>)",
                    s
                )),
            },
        }
    }
}

/// Raised when a sample lies farther from the anchor than the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub raised_at: DateTime<Utc>,
    pub anchor: Anchor,
    pub observed: PositionSample,
    pub distance_meters: f64,
}

impl AlertEvent {
    pub fn title(&self) -> String {
        "Movement detected".to_string()
    }

    pub fn body(&self) -> String {
        format!(
            "Moved {:.1} m from anchor ({}) to ({}), altitude {}",
            self.distance_meters,
            self.anchor.display_coordinates(),
            self.observed.display_coordinates(),
            self.observed.display_altitude()
        )
    }
}

//------------------------------------------------------------------------------
// WATCHER STATE
//------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatcherState {
    /// Constructed, loop not started
    Idle,

    /// Poll loop running
    Polling,

    /// Loop cancelled; terminal
    Stopped,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatcherState::Idle => "idle",
            WatcherState::Polling => "polling",
            WatcherState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Running counters for one watcher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchStats {
    pub polls: u64,
    pub failed_polls: u64,
    pub consecutive_failures: u64,
    pub alerts_raised: u64,
    pub alerts_suppressed: u64,
    pub last_error: Option<String>,
}

/// Point-in-time view of the watcher published to readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherSnapshot {
    pub state: WatcherState,
    pub current: Option<PositionSample>,
    pub config: MonitorConfig,
    pub stats: WatchStats,

    /// Incremented on every arm, including re-arming while armed
    pub arm_generation: u64,

    /// Incremented on every anchor save or clear
    pub anchor_generation: u64,
}

impl WatcherSnapshot {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            state: WatcherState::Idle,
            current: None,
            config,
            stats: WatchStats::default(),
            arm_generation: 0,
            anchor_generation: 0,
        }
    }
}
