//! Source side of the pipeline.
//!
//! The engine never talks to a database client directly. A
//! [`SnapshotSource`] introspects tables and streams their rows in bounded
//! batches, and a [`ChangeSource`] reports the current head of the change
//! log and opens a [`ChangeFeed`] from a position. The MySQL adapter in
//! [`crate::mysql`] implements all three.

use crate::checkpoint::BinlogPosition;
use crate::schema::TableSchema;
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Row values in source column order.
pub type Row = Vec<Value>;

/// Stream of row batches for one table. Each item holds at most the
/// requested batch size; the producer keeps at most one batch in flight.
pub type RowBatchStream = BoxStream<'static, Result<Vec<Row>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// One row-level change read from the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub op: ChangeOperation,
    /// Row before the change; present for updates and deletes.
    pub before: Option<Map<String, Value>>,
    /// Row after the change; present for inserts and updates.
    pub after: Option<Map<String, Value>>,
    /// Commit time in microseconds since the epoch, when the feed knows it.
    pub commit_time_micros: Option<u64>,
    pub token: BinlogPosition,
}

impl ChangeEvent {
    /// The image that is replicated: `before` for deletes, `after` otherwise.
    pub fn image(&self) -> Option<&Map<String, Value>> {
        match self.op {
            ChangeOperation::Delete => self.before.as_ref(),
            ChangeOperation::Insert | ChangeOperation::Update => self.after.as_ref(),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.op == ChangeOperation::Delete
    }
}

/// Raw item produced by a [`ChangeFeed`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(ChangeEvent),
    /// A schema change statement. Never applied; surfaced so that it can be
    /// logged.
    Schema { query: String, token: BinlogPosition },
    /// A point the feed can be reopened at with nothing pending before it,
    /// such as a commit. Carries no rows.
    Boundary { token: BinlogPosition },
}

impl FeedEvent {
    pub fn token(&self) -> &BinlogPosition {
        match self {
            FeedEvent::Change(event) => &event.token,
            FeedEvent::Schema { token, .. } => token,
            FeedEvent::Boundary { token } => token,
        }
    }
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Base tables of the source database.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Columns, types, nullability and primary key of `table`.
    async fn table_schema(&self, table: &str) -> Result<TableSchema>;

    /// Number of rows in `table` at the time of the call.
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Streams every row of `table` in batches of at most `batch_size` rows,
    /// with values in `schema.columns` order.
    async fn stream_rows(&self, schema: &TableSchema, batch_size: usize) -> Result<RowBatchStream>;
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Current head of the change log.
    async fn current_position(&self) -> Result<BinlogPosition>;

    /// Opens the feed at `from` (or at the head when `None`). Row events are
    /// decoded against `tables`; events for other tables may still be
    /// produced and are filtered by the consumer.
    async fn open_feed(
        &self,
        from: Option<&BinlogPosition>,
        tables: &[TableSchema],
    ) -> Result<Box<dyn ChangeFeed>>;
}

#[async_trait]
pub trait ChangeFeed: Send {
    /// Next event in feed order. `None` means the feed ended.
    async fn next_event(&mut self) -> Option<Result<FeedEvent>>;
}
