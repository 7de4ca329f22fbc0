// src/feed.rs
//
// Remote position source. The watcher only sees the `PositionFeed` trait;
// `ThingSpeakFeed` is the HTTP implementation used by the binary.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::config::WatchConfig;
use crate::error::FetchError;
use crate::models::{is_valid_coordinate, PositionSample};

// Longest slice of an error body carried into FetchError::Protocol
const MAX_ERROR_BODY_CHARS: usize = 200;

/// Source of the latest known position
#[async_trait]
pub trait PositionFeed: Send + Sync {
    async fn fetch(&self) -> Result<PositionSample, FetchError>;
}

/// Reads the newest entry of a ThingSpeak channel feed
pub struct ThingSpeakFeed {
    http_client: Client,
    url: Url,
    utc_offset: FixedOffset,
}

impl ThingSpeakFeed {
    pub fn new(
        base_url: &str,
        channel_id: &str,
        read_api_key: Option<&str>,
        request_timeout: Duration,
        utc_offset: FixedOffset,
    ) -> Result<Self> {
        let url = build_feed_url(base_url, channel_id, read_api_key)?;
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            url,
            utc_offset,
        })
    }

    pub fn from_config(config: &WatchConfig) -> Result<Self> {
        Self::new(
            &config.feed_base_url,
            &config.channel_id,
            config.read_api_key.as_deref(),
            config.request_timeout,
            config.feed_utc_offset,
        )
    }
}

#[async_trait]
impl PositionFeed for ThingSpeakFeed {
    async fn fetch(&self) -> Result<PositionSample, FetchError> {
        debug!(
            "Fetching position from {}{}",
            self.url.origin().ascii_serialization(),
            self.url.path()
        );

        let response = self
            .http_client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(FetchError::Protocol {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        parse_feed_payload(&body, self.utc_offset)
    }
}

/// `{base}/channels/{channel}/feeds.json?api_key=...&results=1`
pub fn build_feed_url(base_url: &str, channel_id: &str, read_api_key: Option<&str>) -> Result<Url> {
    let mut url =
        Url::parse(base_url).with_context(|| format!("Invalid feed base URL {:?}", base_url))?;

    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Feed base URL {:?} cannot carry a path", base_url))?
        .pop_if_empty()
        .extend(["channels", channel_id, "feeds.json"]);

    {
        let mut query = url.query_pairs_mut();
        if let Some(key) = read_api_key {
            query.append_pair("api_key", key);
        }
        query.append_pair("results", "1");
    }

    Ok(url)
}

#[derive(Debug, Deserialize)]
struct FeedPayload {
    channel: Option<ChannelData>,
    feeds: Option<Vec<FeedEntry>>,
}

#[derive(Debug, Deserialize)]
struct ChannelData {
    latitude: Option<Value>,
    longitude: Option<Value>,
    elevation: Option<Value>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

/// One feed entry: field1 = latitude, field2 = longitude, field3 = altitude
#[derive(Debug, Deserialize)]
struct FeedEntry {
    created_at: Option<String>,
    field1: Option<Value>,
    field2: Option<Value>,
    field3: Option<Value>,
}

impl ChannelData {
    fn has_coordinates(&self) -> bool {
        is_present(self.latitude.as_ref()) || is_present(self.longitude.as_ref())
    }
}

impl FeedEntry {
    fn has_coordinates(&self) -> bool {
        is_present(self.field1.as_ref()) || is_present(self.field2.as_ref())
    }
}

/// Anything but an absent, null or blank value
fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// Turn a feed response body into the newest position sample
///
/// The newest `feeds` entry wins when it carries coordinates. Channels that
/// publish their position as channel metadata leave `field1`/`field2` null
/// or absent; those fall back to the channel's own latitude and longitude.
/// An entry with non-numeric coordinates is an error, never a fallback.
pub fn parse_feed_payload(
    body: &str,
    utc_offset: FixedOffset,
) -> Result<PositionSample, FetchError> {
    let payload: FeedPayload = serde_json::from_str(body)
        .map_err(|e| FetchError::Parse(format!("invalid JSON: {}", e)))?;

    let newest = match &payload.feeds {
        Some(feeds) => newest_entry(feeds, utc_offset)?,
        None => None,
    };
    let channel = payload.channel.as_ref().filter(|c| c.has_coordinates());

    match (newest, channel) {
        (Some((entry, timestamp)), _) if entry.has_coordinates() => {
            parse_feed_entry(entry, timestamp)
        }
        (_, Some(channel)) => parse_channel(channel, utc_offset),
        // Reports which field is missing
        (Some((entry, timestamp)), None) => parse_feed_entry(entry, timestamp),
        (None, None) if payload.feeds.is_some() => Err(FetchError::Parse(
            "feed contains no samples".to_string(),
        )),
        (None, None) => Err(FetchError::Parse(
            "payload has neither feeds nor channel coordinates".to_string(),
        )),
    }
}

/// Entry with the latest `created_at`, together with its parsed timestamp
fn newest_entry(
    feeds: &[FeedEntry],
    utc_offset: FixedOffset,
) -> Result<Option<(&FeedEntry, DateTime<FixedOffset>)>, FetchError> {
    let mut newest: Option<(&FeedEntry, DateTime<FixedOffset>)> = None;
    for entry in feeds {
        let raw_ts = entry
            .created_at
            .as_deref()
            .ok_or_else(|| FetchError::Parse("feed entry missing created_at".to_string()))?;
        let timestamp = parse_feed_timestamp(raw_ts, utc_offset)?;
        if newest.map_or(true, |(_, ts)| timestamp >= ts) {
            newest = Some((entry, timestamp));
        }
    }
    Ok(newest)
}

fn parse_feed_entry(
    entry: &FeedEntry,
    timestamp: DateTime<FixedOffset>,
) -> Result<PositionSample, FetchError> {
    let latitude = required_number("field1", entry.field1.as_ref())?;
    let longitude = required_number("field2", entry.field2.as_ref())?;
    let altitude = optional_number("field3", entry.field3.as_ref())?;

    build_sample(timestamp, latitude, longitude, altitude)
}

fn parse_channel(channel: &ChannelData, utc_offset: FixedOffset) -> Result<PositionSample, FetchError> {
    let raw_ts = channel
        .updated_at
        .as_deref()
        .or(channel.created_at.as_deref())
        .ok_or_else(|| FetchError::Parse("channel has no timestamp".to_string()))?;
    let timestamp = parse_feed_timestamp(raw_ts, utc_offset)?;
    let latitude = required_number("latitude", channel.latitude.as_ref())?;
    let longitude = required_number("longitude", channel.longitude.as_ref())?;
    let altitude = optional_number("elevation", channel.elevation.as_ref())?;

    build_sample(timestamp, latitude, longitude, altitude)
}

fn build_sample(
    timestamp: DateTime<FixedOffset>,
    latitude: f64,
    longitude: f64,
    altitude: Option<f64>,
) -> Result<PositionSample, FetchError> {
    if !is_valid_coordinate(latitude, longitude) {
        return Err(FetchError::Parse(format!(
            "coordinates out of range: {}, {}",
            latitude, longitude
        )));
    }
    Ok(PositionSample::new(timestamp, latitude, longitude, altitude))
}

/// Parse a feed timestamp and express it at the configured offset
///
/// Accepts RFC 3339 (`2024-10-01T12:00:00Z`) and offset-less
/// `2024-10-01T12:00:00`, which is read as UTC.
pub fn parse_feed_timestamp(
    raw: &str,
    utc_offset: FixedOffset,
) -> Result<DateTime<FixedOffset>, FetchError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&utc_offset));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive).with_timezone(&utc_offset))
        .ok_or_else(|| FetchError::Parse(format!("unrecognised timestamp {:?}", raw)))
}

fn number_from_value(name: &str, value: &Value) -> Result<Option<f64>, FetchError> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(FetchError::Parse(format!(
            "{} is not numeric: {}",
            name, value
        ))),
    }
}

fn required_number(name: &str, value: Option<&Value>) -> Result<f64, FetchError> {
    optional_number(name, value)?
        .ok_or_else(|| FetchError::Parse(format!("{} is missing", name)))
}

fn optional_number(name: &str, value: Option<&Value>) -> Result<Option<f64>, FetchError> {
    match value {
        Some(v) => number_from_value(name, v),
        None => Ok(None),
    }
}
