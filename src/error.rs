// src/error.rs
//
// Error taxonomy for the movement-detection core

use std::path::PathBuf;

use thiserror::Error;

/// Failure to obtain a position sample from the remote feed.
///
/// Every variant is transient from the watcher's point of view: the poll
/// cycle is skipped and the loop keeps its cadence.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Feed returned status {status}: {body}")]
    Protocol { status: u16, body: String },

    #[error("Malformed feed payload: {0}")]
    Parse(String),
}

/// Failure reading or writing the persisted anchor record
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Anchor file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt anchor record: {0}")]
    Corrupt(String),

    #[error("Anchor file is held by another store; lock file {} exists", .0.display())]
    Locked(PathBuf),
}

/// Rejected threshold input
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Threshold {value} outside [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("Threshold input is not a number: {0:?}")]
    NotANumber(String),
}

/// Errors surfaced to callers of the watcher control handle
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("No position sample has been received yet")]
    NoCurrentSample,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Invalid or missing configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
