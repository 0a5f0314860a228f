//! MySQL source adapter.
//!
//! [`MySqlSource`] implements both source traits on top of `mysql_async`:
//! snapshots read through a pooled connection with a streaming text-protocol
//! cursor, and the change feed is a binlog replication stream on a dedicated
//! connection.

mod binlog;
mod connection;
mod value;

pub use binlog::{map_binlog_error, BinlogDecoder, BinlogFeed};
pub use connection::SourceConnection;
pub use value::to_json;

use crate::checkpoint::BinlogPosition;
use crate::config::MySqlConfig;
use crate::schema::{map_type, TableSchema, TargetType};
use crate::source::{ChangeFeed, ChangeSource, Row, RowBatchStream, SnapshotSource};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::prelude::*;
use mysql_async::BinlogStreamRequest;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

pub struct MySqlSource {
    connection: SourceConnection,
    server_id: u32,
    heartbeat_interval_secs: u64,
}

impl MySqlSource {
    pub fn new(config: &MySqlConfig) -> Result<Self> {
        Ok(Self {
            connection: SourceConnection::new(config)?,
            server_id: config.server_id,
            heartbeat_interval_secs: config.heartbeat_interval_secs,
        })
    }

    pub async fn disconnect(self) -> Result<()> {
        self.connection.disconnect().await
    }
}

#[async_trait]
impl SnapshotSource for MySqlSource {
    async fn list_tables(&self) -> Result<Vec<String>> {
        self.connection.list_tables().await
    }

    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        self.connection.table_schema(table).await
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.connection.row_count(table).await
    }

    async fn stream_rows(&self, schema: &TableSchema, batch_size: usize) -> Result<RowBatchStream> {
        let columns = schema
            .columns
            .iter()
            .map(|c| format!("`{}`", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!("SELECT {} FROM `{}`", columns, schema.name);
        let types: Vec<TargetType> = schema
            .columns
            .iter()
            .map(|c| map_type(&c.source_type))
            .collect();

        let pool = self.connection.pool().clone();
        let table = schema.name.clone();
        let batch_size = batch_size.max(1);
        // One batch in flight: the reader waits while the sink writes.
        let (tx, rx) = mpsc::channel::<Result<Vec<Row>>>(1);

        tokio::spawn(async move {
            if let Err(e) = pump_rows(pool, &query, &types, batch_size, &tx).await {
                error!(table = %table, error = %e, "Row cursor failed");
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

async fn pump_rows(
    pool: mysql_async::Pool,
    query: &str,
    types: &[TargetType],
    batch_size: usize,
    tx: &mpsc::Sender<Result<Vec<Row>>>,
) -> Result<()> {
    let mut conn = pool.get_conn().await?;
    let mut result = conn.query_iter(query).await?;
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(mut row) = result.next().await? {
        let values: Row = types
            .iter()
            .enumerate()
            .map(|(index, target)| {
                let value: mysql_async::Value = row.take(index).unwrap_or(mysql_async::Value::NULL);
                to_json(value, target)
            })
            .collect();
        batch.push(values);

        if batch.len() >= batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            if tx.send(Ok(full)).await.is_err() {
                debug!("Row consumer went away, closing cursor");
                return Ok(());
            }
        }
    }

    if !batch.is_empty() {
        let _ = tx.send(Ok(batch)).await;
    }
    Ok(())
}

#[async_trait]
impl ChangeSource for MySqlSource {
    async fn current_position(&self) -> Result<BinlogPosition> {
        self.connection.binlog_head().await
    }

    async fn open_feed(
        &self,
        from: Option<&BinlogPosition>,
        tables: &[TableSchema],
    ) -> Result<Box<dyn ChangeFeed>> {
        let start = match from {
            Some(position) => position.clone(),
            None => self.connection.binlog_head().await?,
        };

        let mut conn = self.connection.dedicated().await?;
        if let Some(statement) = heartbeat_statement(self.heartbeat_interval_secs) {
            conn.query_drop(statement).await?;
        }
        let request = BinlogStreamRequest::new(self.server_id)
            .with_filename(start.file.as_bytes())
            .with_pos(start.position);
        let stream = conn
            .get_binlog_stream(request)
            .await
            .map_err(|e| map_binlog_error(e, &start))?;

        info!(
            position = %start,
            server_id = self.server_id,
            heartbeat_secs = self.heartbeat_interval_secs,
            "Binlog stream opened"
        );

        Ok(Box::new(BinlogFeed::new(
            stream,
            start,
            self.connection.database(),
            tables,
        )))
    }
}

/// Asks the primary to send a heartbeat event after `seconds` without binlog
/// traffic, so a dead connection surfaces as a read error.
fn heartbeat_statement(seconds: u64) -> Option<String> {
    if seconds == 0 {
        return None;
    }
    Some(format!(
        "SET @master_heartbeat_period = {}",
        seconds.saturating_mul(1_000_000_000)
    ))
}
