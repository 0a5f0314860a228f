//! Position persistence for at-least-once delivery.
//!
//! This module records how far the binlog has been replicated so that a
//! restart resumes from the last durably written event instead of running a
//! fresh snapshot.
//!
//! # Example
//!
//! ```rust,no_run
//! use ch_capture::checkpoint::{BinlogPosition, Position, PositionStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut store = PositionStore::new("binlog_position.json");
//!
//!     // Load existing position
//!     if let Some(position) = store.load().await? {
//!         println!("Resuming from {}", position.position_token);
//!     }
//!
//!     // Save new position
//!     let position = Position::new(BinlogPosition::new("mysql-bin.000003", 1547));
//!     store.save(&position).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Ordering token of the change feed.
///
/// Tokens compare by `(file, position, row)`. `position` is the byte offset
/// at which the feed can be reopened (the start of the enclosing
/// transaction) and `row` is the 1-based ordinal of a row change inside that
/// transaction. `row == 0` points before the first row, which is what a
/// freshly captured head position looks like.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Binlog file name, e.g. `mysql-bin.000042`
    pub file: String,
    /// Restart offset inside `file`
    pub position: u64,
    /// Row ordinal inside the transaction starting at `position`
    #[serde(default)]
    pub row: u64,
}

impl BinlogPosition {
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        Self {
            file: file.into(),
            position,
            row: 0,
        }
    }

    pub fn with_row(mut self, row: u64) -> Self {
        self.row = row;
        self
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.file, self.position, self.row)
    }
}

/// A persisted position in the change feed.
///
/// `last_version` is the `_version` assigned to the event at
/// `position_token`; replays after a crash continue the version sequence
/// from it and regenerate the same versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// The last event durably written to the sink
    pub position_token: BinlogPosition,
    /// Seconds since the epoch when this position was recorded
    pub timestamp: f64,
    /// Version of the last replicated row
    #[serde(default)]
    pub last_version: u64,
}

impl Position {
    /// Creates a new position stamped with the current time.
    ///
    /// # Example
    ///
    /// ```rust
    /// use ch_capture::checkpoint::{BinlogPosition, Position};
    ///
    /// let position = Position::new(BinlogPosition::new("mysql-bin.000001", 4));
    /// assert_eq!(position.position_token.position, 4);
    /// assert_eq!(position.last_version, 0);
    /// ```
    pub fn new(position_token: BinlogPosition) -> Self {
        Self {
            position_token,
            timestamp: now_seconds(),
            last_version: 0,
        }
    }

    pub fn with_last_version(mut self, last_version: u64) -> Self {
        self.last_version = last_version;
        self
    }
}

/// Manages position persistence to disk.
///
/// The store is single-writer: only the CDC engine saves positions. Writes
/// go to a temporary file that is synced and renamed over the target, so a
/// concurrent reader sees either the old or the new file, never a partial
/// one. Saving a position that sorts before the last saved one is refused.
pub struct PositionStore {
    file_path: PathBuf,
    last_saved: Option<BinlogPosition>,
}

impl PositionStore {
    /// Creates a new store for the given file path.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            file_path: path.as_ref().to_path_buf(),
            last_saved: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Loads the position from disk if it exists.
    ///
    /// Returns `None` if the file doesn't exist, which means this is the
    /// first run (or the position was deleted) and a snapshot is required.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or does not
    /// contain a valid position.
    pub async fn load(&mut self) -> Result<Option<Position>> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No position file found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read position file: {}", e);
            Error::Io(e)
        })?;

        match serde_json::from_str::<Position>(&content) {
            Ok(position) => {
                info!(
                    file = %position.position_token.file,
                    position = position.position_token.position,
                    row = position.position_token.row,
                    "Loaded binlog position"
                );
                self.last_saved = Some(position.position_token.clone());
                Ok(Some(position))
            }
            Err(e) => {
                error!("Failed to parse position file: {}", e);
                Err(Error::Checkpoint {
                    message: format!("Invalid position file {:?}: {}", self.file_path, e),
                })
            }
        }
    }

    /// Saves the position to disk atomically.
    ///
    /// This method ensures that the position is written atomically by:
    /// 1. Writing to a temporary file
    /// 2. Syncing the file to ensure data is on disk
    /// 3. Atomically renaming the temp file to the final location
    ///
    /// # Errors
    ///
    /// Returns `Err` if the position is older than the last saved one or if
    /// any filesystem operation fails.
    pub async fn save(&mut self, position: &Position) -> Result<()> {
        if let Some(last) = &self.last_saved {
            if position.position_token < *last {
                return Err(Error::Checkpoint {
                    message: format!(
                        "Refusing to move position backwards from {} to {}",
                        last, position.position_token
                    ),
                });
            }
        }

        debug!(position = %position.position_token, "Saving binlog position");

        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(position)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        self.last_saved = Some(position.position_token.clone());
        debug!("Position saved successfully");
        Ok(())
    }

    /// Deletes the position file if it exists, forcing a fresh snapshot on
    /// the next run.
    pub async fn delete(&mut self) -> Result<()> {
        if fs::try_exists(&self.file_path).await? {
            fs::remove_file(&self.file_path).await?;
            info!("Deleted position file");
        }
        self.last_saved = None;
        Ok(())
    }
}

pub(crate) fn now_seconds() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}
