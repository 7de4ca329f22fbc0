// src/anchor_store.rs
//
// Durable storage for the single anchor record

use std::fs::{self as std_fs, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat};
use log::{debug, info, warn};
use tempfile::Builder;
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::models::{is_valid_coordinate, Anchor, PositionSample};

/// Reads and writes the anchor file
///
/// The record is one line: `timestamp,latitude,longitude,altitude`. The
/// timestamp is RFC 3339 with its offset and the numbers use the shortest
/// representation that parses back to the identical `f64`, so nothing is
/// lost to display rounding. A missing altitude is an empty last field.
///
/// Opening a store takes `<file>.lock` exclusively, so at most one store
/// per anchor file exists across processes; the lock file is removed when
/// the store is dropped. A lock left behind by a killed process has to be
/// removed by hand. Writes go to a uniquely named sibling temp file which
/// is then renamed over the record, and an async mutex serializes
/// save/load within the store.
pub struct AnchorStore {
    path: PathBuf,
    lock: Mutex<()>,
    _lock_file: LockFile,
}

impl AnchorStore {
    /// Open the store, creating parent directories and taking the lock
    /// file. Fails with `StorageError::Locked` when another store holds it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let dir = parent_dir(&path);
        std_fs::create_dir_all(&dir)?;

        let lock_file = LockFile::acquire(lock_path(&path))?;
        debug!("Opened anchor store at {}", path.display());

        Ok(Self {
            path,
            lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the stored anchor
    pub async fn save(&self, anchor: &Anchor) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        let record = encode_record(anchor);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_replacing(&path, record.as_bytes()))
            .await
            .map_err(io::Error::other)??;

        info!(
            "Saved anchor ({}) to {}",
            anchor.display_coordinates(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the stored anchor; `Ok(None)` when none has been saved yet
    pub async fn load(&self) -> Result<Option<Anchor>, StorageError> {
        let _guard = self.lock.lock().await;
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No anchor file at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        decode_record(&contents).map(Some)
    }

    /// Remove the stored anchor. Succeeds when there is nothing to remove.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Cleared anchor at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// `<file>.lock` next to the anchor file
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "anchor".into());
    name.push(".lock");
    path.with_file_name(name)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Write `contents` to a fresh temp file beside `path` and rename it into
/// place. The temp file is deleted if any step fails.
fn write_replacing(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut prefix = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "anchor".into());
    prefix.push(".");

    let mut temp = Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent_dir(path))?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Exclusive marker file, removed on drop
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: PathBuf) -> Result<Self, StorageError> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::Locked(path));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let lock = Self { path };
        writeln!(file, "{}", std::process::id())?;
        Ok(lock)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std_fs::remove_file(&self.path) {
            warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        }
    }
}

pub fn encode_record(anchor: &Anchor) -> String {
    let altitude = anchor
        .altitude()
        .map(|alt| alt.to_string())
        .unwrap_or_default();
    format!(
        "{},{},{},{}\n",
        anchor
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::AutoSi, false),
        anchor.latitude(),
        anchor.longitude(),
        altitude
    )
}

pub fn decode_record(contents: &str) -> Result<Anchor, StorageError> {
    let line = contents.trim();
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 4 {
        return Err(StorageError::Corrupt(format!(
            "expected 4 fields, found {} in {:?}",
            fields.len(),
            line
        )));
    }

    let timestamp = DateTime::parse_from_rfc3339(fields[0].trim())
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {:?}: {}", fields[0], e)))?;
    let latitude = parse_field("latitude", fields[1])?;
    let longitude = parse_field("longitude", fields[2])?;
    if !is_valid_coordinate(latitude, longitude) {
        return Err(StorageError::Corrupt(format!(
            "coordinates out of range: {}, {}",
            latitude, longitude
        )));
    }
    let altitude = match fields[3].trim() {
        "" => None,
        raw => Some(parse_field("altitude", raw)?),
    };

    Ok(Anchor::from_sample(PositionSample::new(
        timestamp, latitude, longitude, altitude,
    )))
}

fn parse_field(name: &str, raw: &str) -> Result<f64, StorageError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| StorageError::Corrupt(format!("bad {} {:?}", name, raw)))
}
