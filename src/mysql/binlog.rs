//! Binlog change feed.
//!
//! Row events are only restartable at transaction boundaries: the table map
//! events a row event depends on are written at the start of each
//! transaction. The [`BinlogDecoder`] therefore tracks the offset of the
//! current transaction start and numbers the rows inside it, producing
//! tokens `(file, transaction start, row ordinal)`. Reopening the feed at a
//! token's offset replays the whole transaction, and the consumer skips the
//! rows it already has.
//!
//! Every commit and rotate is also surfaced as a [`FeedEvent::Boundary`], so
//! the consumer can advance its position past transactions of tables it does
//! not replicate.

use crate::checkpoint::BinlogPosition;
use crate::mysql::value::{enum_label, set_labels, to_json};
use crate::schema::{map_type, SourceKind, TableSchema, TargetType};
use crate::source::{ChangeEvent, ChangeFeed, ChangeOperation, FeedEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::binlog::events::{Event, EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStream, Value as MySqlValue};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// MySQL error `ER_MASTER_FATAL_ERROR_READING_BINLOG`: the requested file or
/// offset is no longer available.
const ER_BINLOG_UNAVAILABLE: u16 = 1236;

/// Tracks where the feed could be reopened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogDecoder {
    file: String,
    restart_pos: u64,
    row_seq: u64,
    /// `immediate_commit_timestamp` of the current transaction's GTID event.
    commit_micros: Option<u64>,
}

impl BinlogDecoder {
    pub fn new(start: &BinlogPosition) -> Self {
        Self {
            file: start.file.clone(),
            restart_pos: start.position,
            row_seq: 0,
            commit_micros: None,
        }
    }

    /// Token for the next row of the current transaction.
    pub fn next_row(&mut self) -> BinlogPosition {
        self.row_seq += 1;
        BinlogPosition::new(self.file.clone(), self.restart_pos).with_row(self.row_seq)
    }

    /// The server switched to `file`. Also sent once when the stream opens.
    pub fn on_rotate(&mut self, file: &str, position: u64) {
        self.row_seq = 0;
        self.file = file.to_string();
        self.restart_pos = position;
    }

    /// A transaction committed; the next one starts at `next_pos`.
    pub fn on_commit(&mut self, next_pos: u64) {
        if next_pos > 0 {
            self.restart_pos = next_pos;
        }
        self.row_seq = 0;
        self.commit_micros = None;
    }

    /// GTID event opening a transaction. Servers before 8.0 send 0.
    pub fn on_gtid(&mut self, immediate_commit_timestamp: u64) {
        self.commit_micros = (immediate_commit_timestamp > 0).then_some(immediate_commit_timestamp);
    }

    /// Commit time of the current transaction in microseconds, falling back
    /// to the event header's whole seconds.
    pub fn commit_time_micros(&self, header_seconds: u32) -> u64 {
        self.commit_micros
            .unwrap_or_else(|| u64::from(header_seconds) * 1_000_000)
    }

    pub fn boundary(&self) -> FeedEvent {
        FeedEvent::Boundary {
            token: self.position(),
        }
    }

    /// Classifies a query event. `BEGIN` opens a transaction, `COMMIT` closes
    /// a non-transactional one, anything else is a schema change.
    pub fn on_query(&mut self, query: &str, next_pos: u64) -> Option<FeedEvent> {
        let statement = query.trim().trim_end_matches(';').to_ascii_uppercase();
        match statement.as_str() {
            "BEGIN" | "XA START" => None,
            "COMMIT" => {
                self.on_commit(next_pos);
                Some(self.boundary())
            }
            _ => {
                self.on_commit(next_pos);
                Some(FeedEvent::Schema {
                    query: query.to_string(),
                    token: self.position(),
                })
            }
        }
    }

    pub fn position(&self) -> BinlogPosition {
        BinlogPosition::new(self.file.clone(), self.restart_pos).with_row(self.row_seq)
    }
}

/// Change feed backed by a binlog replication connection.
pub struct BinlogFeed {
    stream: BinlogStream,
    decoder: BinlogDecoder,
    database: String,
    tables: HashMap<String, Decoding>,
    pending: VecDeque<FeedEvent>,
    start: BinlogPosition,
}

/// Columns of one replicated table, by ordinal.
struct Decoding {
    columns: Vec<BinlogColumn>,
}

struct BinlogColumn {
    name: String,
    target: TargetType,
    kind: SourceKind,
    /// Enum or set labels.
    members: Vec<String>,
}

impl BinlogColumn {
    /// Binlog rows carry enums as their index and sets as a bitmask, where
    /// the text protocol returns labels.
    fn value(&self, value: MySqlValue) -> Value {
        match (self.kind, value) {
            (SourceKind::Enum, MySqlValue::Int(index)) if index >= 0 => {
                enum_label(index as u64, &self.members)
                    .unwrap_or_else(|| self.unresolved(index.to_string()))
            }
            (SourceKind::Enum, MySqlValue::UInt(index)) => enum_label(index, &self.members)
                .unwrap_or_else(|| self.unresolved(index.to_string())),
            (SourceKind::Set, MySqlValue::Bytes(mask)) => set_labels(&mask, &self.members),
            (_, value) => to_json(value, &self.target),
        }
    }

    fn unresolved(&self, index: String) -> Value {
        warn!(column = %self.name, index = %index, "Enum index outside the known labels");
        Value::String(index)
    }
}

impl BinlogFeed {
    pub fn new(
        stream: BinlogStream,
        start: BinlogPosition,
        database: impl Into<String>,
        tables: &[TableSchema],
    ) -> Self {
        let tables = tables
            .iter()
            .map(|t| {
                let columns = t
                    .columns
                    .iter()
                    .map(|c| BinlogColumn {
                        name: c.name.clone(),
                        target: map_type(&c.source_type),
                        kind: c.source_type.kind(),
                        members: c.source_type.members.clone(),
                    })
                    .collect();
                (t.name.clone(), Decoding { columns })
            })
            .collect();

        Self {
            stream,
            decoder: BinlogDecoder::new(&start),
            database: database.into(),
            tables,
            pending: VecDeque::new(),
            start,
        }
    }

    fn decode(&mut self, event: Event) -> Result<()> {
        let header = event.header();
        let next_pos = u64::from(header.log_pos());
        let header_seconds = header.timestamp();

        let data = event.read_data().map_err(|e| Error::InvalidMessage {
            message: format!("undecodable binlog event at {}: {}", self.decoder.position(), e),
        })?;

        match data {
            Some(EventData::RotateEvent(rotate)) => {
                let name = rotate.name();
                trace!(file = %name, position = rotate.position(), "Binlog rotate");
                self.decoder.on_rotate(&name, rotate.position());
                self.pending.push_back(self.decoder.boundary());
            }
            Some(EventData::GtidEvent(gtid)) => {
                self.decoder.on_gtid(gtid.immediate_commit_timestamp())
            }
            Some(EventData::AnonymousGtidEvent(gtid)) => {
                self.decoder.on_gtid(gtid.0.immediate_commit_timestamp())
            }
            Some(EventData::XidEvent(_)) => {
                self.decoder.on_commit(next_pos);
                self.pending.push_back(self.decoder.boundary());
            }
            Some(EventData::QueryEvent(query)) => {
                if let Some(event) = self.decoder.on_query(&query.query(), next_pos) {
                    self.pending.push_back(event);
                }
            }
            Some(EventData::RowsEvent(rows)) => {
                let commit_time_micros = self.decoder.commit_time_micros(header_seconds);
                self.decode_rows(&rows, commit_time_micros)?
            }
            _ => {}
        }
        Ok(())
    }

    fn decode_rows(&mut self, rows: &RowsEventData<'_>, commit_time_micros: u64) -> Result<()> {
        let tme = self
            .stream
            .get_tme(rows.table_id())
            .ok_or_else(|| Error::InvalidMessage {
                message: format!(
                    "rows event for unknown table id {} at {}",
                    rows.table_id(),
                    self.decoder.position()
                ),
            })?;

        let table = tme.table_name().into_owned();
        let decoding = if tme.database_name() == self.database.as_str() {
            self.tables.get(&table)
        } else {
            None
        };

        for row in rows.rows(tme) {
            let (before, after) = row.map_err(|e| Error::InvalidMessage {
                message: format!("undecodable row of table '{}': {}", table, e),
            })?;
            // Every row is numbered, replicated or not, so tokens stay stable.
            let token = self.decoder.next_row();
            let Some(decoding) = decoding else {
                continue;
            };

            let op = match (&before, &after) {
                (None, Some(_)) => ChangeOperation::Insert,
                (Some(_), Some(_)) => ChangeOperation::Update,
                (Some(_), None) => ChangeOperation::Delete,
                (None, None) => continue,
            };

            self.pending.push_back(FeedEvent::Change(ChangeEvent {
                table: table.clone(),
                op,
                before: before.map(|r| decoding.image(r)),
                after: after.map(|r| decoding.image(r)),
                commit_time_micros: Some(commit_time_micros),
                token,
            }));
        }
        Ok(())
    }
}

impl Decoding {
    fn image(&self, mut row: BinlogRow) -> Map<String, Value> {
        let mut image = Map::with_capacity(self.columns.len());
        for (index, column) in self.columns.iter().enumerate() {
            if index >= row.len() {
                break;
            }
            let name = &column.name;
            let value = match row.take(index) {
                Some(BinlogValue::Value(value)) => column.value(value),
                Some(BinlogValue::Jsonb(jsonb)) => serde_json::Value::try_from(jsonb)
                    .map(|json| Value::String(json.to_string()))
                    .unwrap_or(Value::Null),
                Some(BinlogValue::JsonDiff(_)) => {
                    warn!(column = %name, "Partial JSON update cannot be replicated");
                    Value::Null
                }
                None => continue,
            };
            image.insert(name.clone(), value);
        }
        image
    }
}

#[async_trait]
impl ChangeFeed for BinlogFeed {
    async fn next_event(&mut self) -> Option<Result<FeedEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }

            let event = match self.stream.next().await? {
                Ok(event) => event,
                Err(e) => return Some(Err(map_binlog_error(e, &self.start))),
            };
            if let Err(e) = self.decode(event) {
                return Some(Err(e));
            }
        }
    }
}

/// Turns "binlog no longer available" into [`Error::CheckpointExpired`].
pub fn map_binlog_error(error: mysql_async::Error, start: &BinlogPosition) -> Error {
    match &error {
        mysql_async::Error::Server(server) if server.code == ER_BINLOG_UNAVAILABLE => {
            debug!(code = server.code, "Binlog position is no longer available");
            Error::CheckpointExpired {
                position: start.to_string(),
                message: server.message.clone(),
            }
        }
        _ => Error::MySql(error),
    }
}
