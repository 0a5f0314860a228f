#![allow(dead_code)]

use async_trait::async_trait;
use ch_capture::checkpoint::BinlogPosition;
use ch_capture::schema::{ColumnDescriptor, SourceType, TableSchema, DELETED_COLUMN, VERSION_COLUMN};
use ch_capture::sink::{BatchSink, SinkError};
use ch_capture::source::{
    ChangeEvent, ChangeFeed, ChangeOperation, ChangeSource, FeedEvent, Row, RowBatchStream,
    SnapshotSource,
};
use ch_capture::{Error, Result};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const BINLOG_FILE: &str = "mysql-bin.000001";

pub fn token(position: u64, row: u64) -> BinlogPosition {
    BinlogPosition::new(BINLOG_FILE, position).with_row(row)
}

/// `users(id PK, name, deleted_at)`
pub fn users_schema() -> TableSchema {
    TableSchema::new(
        "users",
        vec![
            ColumnDescriptor::new("id", SourceType::new("int"), false),
            ColumnDescriptor::new("name", SourceType::new("varchar").with_length(255), true),
            ColumnDescriptor::new("deleted_at", SourceType::new("datetime"), true),
        ],
        vec!["id".to_string()],
    )
}

pub fn simple_schema(name: &str) -> TableSchema {
    TableSchema::new(
        name,
        vec![
            ColumnDescriptor::new("id", SourceType::new("bigint"), false),
            ColumnDescriptor::new("value", SourceType::new("text"), true),
        ],
        vec!["id".to_string()],
    )
}

pub fn image(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub fn change(
    table: &str,
    op: ChangeOperation,
    before: Option<Value>,
    after: Option<Value>,
    token: BinlogPosition,
) -> FeedEvent {
    FeedEvent::Change(ChangeEvent {
        table: table.to_string(),
        op,
        before: before.map(image),
        after: after.map(image),
        commit_time_micros: Some(1_000_000),
        token,
    })
}

/// In-memory source: tables for snapshots plus an append-only change log.
pub struct MemorySource {
    tables: Mutex<BTreeMap<String, (TableSchema, Vec<Row>)>>,
    failing_streams: Mutex<HashSet<String>>,
    head: Mutex<BinlogPosition>,
    log: Arc<Mutex<Vec<FeedEvent>>>,
    appended: Arc<Notify>,
    delivered: Arc<AtomicUsize>,
    close_when_drained: bool,
    pub feeds_opened: AtomicUsize,
}

impl MemorySource {
    /// Feed that waits for more events once drained.
    pub fn live() -> Self {
        Self::new(false)
    }

    /// Feed that ends once every appended event was delivered.
    pub fn finite() -> Self {
        Self::new(true)
    }

    fn new(close_when_drained: bool) -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
            failing_streams: Mutex::new(HashSet::new()),
            head: Mutex::new(token(4, 0)),
            log: Arc::new(Mutex::new(Vec::new())),
            appended: Arc::new(Notify::new()),
            delivered: Arc::new(AtomicUsize::new(0)),
            close_when_drained,
            feeds_opened: AtomicUsize::new(0),
        }
    }

    pub fn with_table(self, schema: TableSchema, rows: Vec<Row>) -> Self {
        self.tables
            .lock()
            .unwrap()
            .insert(schema.name.clone(), (schema, rows));
        self
    }

    pub fn with_head(self, head: BinlogPosition) -> Self {
        *self.head.lock().unwrap() = head;
        self
    }

    pub fn fail_stream(&self, table: &str) {
        self.failing_streams.lock().unwrap().insert(table.to_string());
    }

    pub fn push(&self, event: FeedEvent) {
        self.log.lock().unwrap().push(event);
        self.appended.notify_one();
    }

    /// Events handed out by all feeds so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for MemorySource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.lock().unwrap().keys().cloned().collect())
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|(schema, _)| schema.clone())
            .ok_or_else(|| Error::Schema {
                table: table.to_string(),
                message: "no such table".to_string(),
            })
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .map(|(_, rows)| rows.len() as u64)
            .unwrap_or(0))
    }

    async fn stream_rows(&self, schema: &TableSchema, batch_size: usize) -> Result<RowBatchStream> {
        let rows = self
            .tables
            .lock()
            .unwrap()
            .get(&schema.name)
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        let fail = self.failing_streams.lock().unwrap().contains(&schema.name);

        let mut batches: Vec<Result<Vec<Row>>> = rows
            .chunks(batch_size.max(1))
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        if fail {
            batches.truncate(1);
            batches.push(Err(Error::Connection("cursor lost".to_string())));
        }
        Ok(futures::stream::iter(batches).boxed())
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    async fn current_position(&self) -> Result<BinlogPosition> {
        Ok(self.head.lock().unwrap().clone())
    }

    async fn open_feed(
        &self,
        from: Option<&BinlogPosition>,
        _tables: &[TableSchema],
    ) -> Result<Box<dyn ChangeFeed>> {
        self.feeds_opened.fetch_add(1, Ordering::SeqCst);
        let from = match from {
            Some(position) => position.clone(),
            None => self.head.lock().unwrap().clone(),
        };
        Ok(Box::new(MemoryFeed {
            log: Arc::clone(&self.log),
            appended: Arc::clone(&self.appended),
            delivered: Arc::clone(&self.delivered),
            close_when_drained: self.close_when_drained,
            from,
            index: 0,
        }))
    }
}

/// Reopens at transaction granularity like the binlog does: every event
/// whose `(file, position)` is at or after the start is replayed.
struct MemoryFeed {
    log: Arc<Mutex<Vec<FeedEvent>>>,
    appended: Arc<Notify>,
    delivered: Arc<AtomicUsize>,
    close_when_drained: bool,
    from: BinlogPosition,
    index: usize,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next_event(&mut self) -> Option<Result<FeedEvent>> {
        loop {
            let next = self.log.lock().unwrap().get(self.index).cloned();
            match next {
                Some(event) => {
                    self.index += 1;
                    let t = event.token();
                    if (t.file.as_str(), t.position) < (self.from.file.as_str(), self.from.position)
                    {
                        continue;
                    }
                    self.delivered.fetch_add(1, Ordering::SeqCst);
                    return Some(Ok(event));
                }
                None if self.close_when_drained => return None,
                None => self.appended.notified().await,
            }
        }
    }
}

/// Records DDL and rows; can be told to reject writes to given tables.
#[derive(Default)]
pub struct MemorySink {
    ddl: Mutex<Vec<String>>,
    rows: Mutex<BTreeMap<String, Vec<Row>>>,
    columns: Mutex<HashMap<String, Vec<String>>>,
    writes: Mutex<Vec<(String, usize)>>,
    failing: Mutex<HashSet<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes_to(&self, table: &str) {
        self.failing.lock().unwrap().insert(table.to_string());
    }

    pub fn ddl(&self) -> Vec<String> {
        self.ddl.lock().unwrap().clone()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.rows
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn columns(&self, table: &str) -> Vec<String> {
        self.columns
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// `(table, row count)` per write call, in call order.
    pub fn writes(&self) -> Vec<(String, usize)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().values().map(Vec::len).sum()
    }

    /// Rows of `table` after ReplacingMergeTree-style deduplication: for
    /// each key (first column) the row with the highest `_version`.
    pub fn resolved(&self, table: &str) -> BTreeMap<String, Row> {
        let columns = self.columns(table);
        let version_at = columns.iter().position(|c| c == VERSION_COLUMN);
        let mut resolved: BTreeMap<String, Row> = BTreeMap::new();

        for row in self.rows(table) {
            let key = row[0].to_string();
            let version = |r: &Row| version_at.and_then(|i| r[i].as_u64()).unwrap_or(0);
            let newer = match resolved.get(&key) {
                Some(existing) => version(&row) >= version(existing),
                None => true,
            };
            if newer {
                resolved.insert(key, row);
            }
        }
        resolved
    }

    /// What `<table>_live` would return.
    pub fn live(&self, table: &str) -> Vec<Row> {
        let columns = self.columns(table);
        let deleted_at = columns.iter().position(|c| c == DELETED_COLUMN);
        self.resolved(table)
            .into_values()
            .filter(|row| deleted_at.map(|i| row[i] == Value::from(0)).unwrap_or(true))
            .collect()
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn execute_ddl(&self, statement: &str) -> std::result::Result<(), SinkError> {
        self.ddl.lock().unwrap().push(statement.to_string());
        Ok(())
    }

    async fn write(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> std::result::Result<(), SinkError> {
        if self.failing.lock().unwrap().contains(table) {
            return Err(SinkError::Rejected {
                status: 500,
                message: format!("Code: 241. Memory limit exceeded while writing {}", table),
            });
        }
        self.columns
            .lock()
            .unwrap()
            .insert(table.to_string(), columns.to_vec());
        self.rows
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        self.writes
            .lock()
            .unwrap()
            .push((table.to_string(), rows.len()));
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition().await
}
