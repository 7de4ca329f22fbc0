// src/lib.rs
pub mod anchor_store;
pub mod config;
pub mod error;
pub mod feed;
pub mod geo;
pub mod models;
pub mod sinks;
pub mod threshold;
pub mod watcher;

// Re-export common types for easier access
pub use models::{
    AlertEvent, AlertRepeatPolicy, Anchor, MonitorConfig, PositionSample, WatchStats,
    WatcherSnapshot, WatcherState,
};

// Re-export important functionality
pub use anchor_store::AnchorStore;
pub use config::WatchConfig;
pub use error::{ConfigError, FetchError, StorageError, ValidationError, WatchError};
pub use feed::{PositionFeed, ThingSpeakFeed};
pub use geo::distance;
pub use sinks::{DisplaySink, LogDisplaySink, LogNotificationSink, NotificationSink};
pub use watcher::{CycleOutcome, MovementWatcher, WatcherControls, WatcherHandle, WatcherOptions};
