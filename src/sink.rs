//! Target side of the pipeline.
//!
//! A [`BatchSink`] applies DDL and appends rows to a named table. It does not
//! retry: a failed call is reported to the caller unchanged, and the caller
//! decides whether that is fatal (CDC streaming) or local to one table
//! (snapshot).

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a [`BatchSink`].
#[derive(Error, Debug)]
pub enum SinkError {
    /// The request never got a response (connection refused, timeout, reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// The store answered with an error.
    #[error("rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status (or equivalent) returned by the store
        status: u16,
        /// Error body returned by the store
        message: String,
    },

    /// Rows could not be encoded for transport.
    #[error("encoding error: {0}")]
    Encoding(String),
}

#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Executes one DDL statement (create/drop table, create/drop view).
    async fn execute_ddl(&self, statement: &str) -> Result<(), SinkError>;

    /// Appends `rows` to `table`. Each row holds one value per entry of
    /// `columns`, in the same order.
    async fn write(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<(), SinkError>;
}
