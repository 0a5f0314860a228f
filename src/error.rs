//! Error types and result handling for ch-capture.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate. Errors raised by a
//! [`BatchSink`](crate::sink::BatchSink) are described separately by
//! [`SinkError`](crate::sink::SinkError) and wrapped into [`Error::Sink`]
//! together with the table they were writing.
//!
//! # Example
//!
//! ```rust
//! use ch_capture::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use crate::sink::SinkError;
use thiserror::Error;

/// The main error type for ch-capture operations.
///
/// Every variant except [`Error::Shutdown`] is fatal to the process: the
/// binary logs it and exits with a non-zero status so that an external
/// supervisor decides whether to restart.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error: missing connection parameters, invalid
    /// identifiers, unreadable secret files.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A source table cannot be converted into a target table.
    #[error("Schema error in table '{table}': {message}")]
    Schema {
        /// Source table name
        table: String,
        /// Description of the problem
        message: String,
    },

    /// MySQL client or protocol error.
    #[error("MySQL error: {0}")]
    MySql(#[from] mysql_async::Error),

    /// The sink rejected a DDL statement or a batch of rows.
    #[error("Sink error on table '{table}': {source}")]
    Sink {
        /// Target table the operation was addressed to
        table: String,
        /// Underlying sink failure
        #[source]
        source: SinkError,
    },

    /// The source can no longer serve events from the saved position.
    ///
    /// Recovery requires deleting the position file and running a fresh
    /// snapshot, so this is kept apart from ordinary connectivity errors.
    #[error("Change feed can no longer resume from {position}: {message}")]
    CheckpointExpired {
        /// The position the feed was asked to resume from
        position: String,
        /// Message reported by the source
        message: String,
    },

    /// Position file is unreadable, malformed, or would move backwards.
    #[error("Checkpoint error: {message}")]
    Checkpoint {
        /// Description of the checkpoint problem
        message: String,
    },

    /// One or more tables failed during the initial snapshot.
    #[error("Snapshot failed for tables: {}", failed.join(", "))]
    Snapshot {
        /// Names of the tables whose copy did not complete
        failed: Vec<String>,
    },

    /// JSON serialization error when encoding rows or positions.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from position file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Replication-specific error.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// Invalid or malformed change feed message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Graceful shutdown was requested (e.g., via Ctrl+C) before the
    /// operation could complete.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    pub(crate) fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    pub(crate) fn sink(table: impl Into<String>, source: SinkError) -> Self {
        Error::Sink {
            table: table.into(),
            source,
        }
    }
}

/// A convenient Result type alias for ch-capture operations.
///
/// This is equivalent to `std::result::Result<T, ch_capture::Error>`.
///
/// # Example
///
/// ```rust
/// use ch_capture::Result;
///
/// fn do_something() -> Result<String> {
///     Ok("Success".to_string())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
