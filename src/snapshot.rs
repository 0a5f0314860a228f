//! Initial bulk copy of existing rows.
//!
//! Each table is copied by its own task: it introspects the source table,
//! (re)creates the target table, then pulls row batches from the source and
//! writes them to the sink one at a time, so memory stays bounded by a
//! single batch no matter how large the table is. A `Semaphore` caps how
//! many tables are copied at once. A failing table is reported and does not
//! affect the others.

use crate::schema::{
    convert, render_create_database, render_create_statement, render_drop_statement,
    render_drop_view_statement, render_view_statement, validate_identifier, TableSchema,
    TargetTableSchema,
};
use crate::sink::BatchSink;
use crate::source::{Row, SnapshotSource};
use crate::{Error, Result};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const PROGRESS_EVERY_BATCHES: u64 = 10;

#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Target database; created if missing.
    pub database: String,
    pub batch_size: usize,
    /// Number of tables copied concurrently.
    pub parallelism: usize,
    /// Drop the target view and table before copying.
    pub drop_existing: bool,
    /// `_version` stamped on every copied row. `Some` creates CDC tables
    /// (bookkeeping columns and live view), `None` plain tables.
    pub cdc_version: Option<u64>,
}

impl SnapshotOptions {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            batch_size: 50_000,
            parallelism: 1,
            drop_existing: false,
            cdc_version: None,
        }
    }
}

/// Outcome of copying one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableReport {
    pub table: String,
    pub rows_written: u64,
    /// Row count reported by the source before copying, if available.
    pub source_rows: Option<u64>,
    pub error: Option<String>,
}

impl TableReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotReport {
    pub tables: Vec<TableReport>,
    pub elapsed: Duration,
}

impl SnapshotReport {
    pub fn failed(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|t| !t.is_success())
            .map(|t| t.table.clone())
            .collect()
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_written).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// `Err(Error::Snapshot)` naming the failed tables, if any.
    pub fn into_result(self) -> Result<Self> {
        let failed = self.failed();
        if failed.is_empty() {
            Ok(self)
        } else {
            Err(Error::Snapshot { failed })
        }
    }
}

pub struct Snapshotter {
    source: Arc<dyn SnapshotSource>,
    sink: Arc<dyn BatchSink>,
    options: SnapshotOptions,
}

impl Snapshotter {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn BatchSink>,
        options: SnapshotOptions,
    ) -> Self {
        Self {
            source,
            sink,
            options,
        }
    }

    /// Copies `tables`. Per-table failures are collected in the report; only
    /// a failure to create the target database is returned as `Err`.
    pub async fn run(
        &self,
        tables: &[String],
        shutdown: CancellationToken,
    ) -> Result<SnapshotReport> {
        let started = Instant::now();
        info!(
            tables = tables.len(),
            parallelism = self.options.parallelism,
            batch_size = self.options.batch_size,
            cdc = self.options.cdc_version.is_some(),
            "Starting snapshot"
        );

        let database = &self.options.database;
        self.sink
            .execute_ddl(&render_create_database(database))
            .await
            .map_err(|e| Error::sink(database.as_str(), e))?;

        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let mut handles: Vec<(String, JoinHandle<TableReport>)> = Vec::with_capacity(tables.len());

        for table in tables {
            let worker = TableWorker {
                source: Arc::clone(&self.source),
                sink: Arc::clone(&self.sink),
                options: self.options.clone(),
                table: table.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let shutdown = shutdown.clone();

            let handle = tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return worker.report(0, None, Some(Error::Shutdown)),
                };
                worker.run(shutdown).await
            });
            handles.push((table.clone(), handle));
        }

        let mut report = SnapshotReport::default();
        for (table, handle) in handles {
            let table_report = match handle.await {
                Ok(table_report) => table_report,
                Err(e) => {
                    error!(table = %table, error = %e, "Snapshot worker panicked");
                    TableReport {
                        table,
                        rows_written: 0,
                        source_rows: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.tables.push(table_report);
        }
        report.elapsed = started.elapsed();

        let failed = report.failed();
        if failed.is_empty() {
            info!(
                tables = report.tables.len(),
                rows = report.total_rows(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Snapshot completed"
            );
        } else {
            error!(
                failed = ?failed,
                rows = report.total_rows(),
                "Snapshot completed with failures"
            );
        }

        Ok(report)
    }
}

struct TableWorker {
    source: Arc<dyn SnapshotSource>,
    sink: Arc<dyn BatchSink>,
    options: SnapshotOptions,
    table: String,
}

impl TableWorker {
    async fn run(self, shutdown: CancellationToken) -> TableReport {
        let source_rows = match self.source.row_count(&self.table).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(table = %self.table, error = %e, "Could not count source rows");
                None
            }
        };

        let mut rows_written = 0;
        let result = self.copy(source_rows, &mut rows_written, &shutdown).await;
        self.report(rows_written, source_rows, result.err())
    }

    fn report(&self, rows_written: u64, source_rows: Option<u64>, error: Option<Error>) -> TableReport {
        if let Some(e) = &error {
            error!(
                table = %self.table,
                rows_written,
                error = %e,
                "Snapshot of table failed"
            );
        }
        TableReport {
            table: self.table.clone(),
            rows_written,
            source_rows,
            error: error.map(|e| e.to_string()),
        }
    }

    #[instrument(skip_all, fields(table = %self.table))]
    async fn copy(
        &self,
        source_rows: Option<u64>,
        rows_written: &mut u64,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let schema = self.source.table_schema(&self.table).await?;
        let target = ensure_target_table(
            self.sink.as_ref(),
            &schema,
            &self.options.database,
            self.options.cdc_version.is_some(),
            self.options.drop_existing,
        )
        .await?;
        let columns = target.column_names();

        info!(rows = ?source_rows, "Copying table");

        let mut stream = self
            .source
            .stream_rows(&schema, self.options.batch_size)
            .await?;
        let mut batches: u64 = 0;

        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(Error::Shutdown),
                batch = stream.next() => batch,
            };
            let Some(batch) = batch else { break };
            let rows = self.to_target_rows(&schema, batch?)?;
            if rows.is_empty() {
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(Error::Shutdown),
                written = self.sink.write(&target.name, &columns, &rows) => {
                    written.map_err(|e| Error::sink(target.name.as_str(), e))?;
                }
            }

            *rows_written += rows.len() as u64;
            batches += 1;
            if batches % PROGRESS_EVERY_BATCHES == 0 {
                match source_rows {
                    Some(total) if total > 0 => info!(
                        rows = *rows_written,
                        total,
                        percent = (*rows_written as f64 / total as f64 * 100.0).min(100.0) as u64,
                        "Snapshot progress"
                    ),
                    _ => info!(rows = *rows_written, "Snapshot progress"),
                }
            } else {
                debug!(rows = *rows_written, batches, "Wrote snapshot batch");
            }
        }

        info!(rows = *rows_written, batches, "Table copied");
        Ok(())
    }

    fn to_target_rows(&self, schema: &TableSchema, batch: Vec<Row>) -> Result<Vec<Row>> {
        let width = schema.columns.len();
        batch
            .into_iter()
            .map(|mut row| {
                if row.len() != width {
                    return Err(Error::InvalidMessage {
                        message: format!(
                            "row of table '{}' has {} values, expected {}",
                            schema.name,
                            row.len(),
                            width
                        ),
                    });
                }
                if let Some(version) = self.options.cdc_version {
                    row.push(Value::from(version));
                    row.push(Value::from(0u8));
                }
                Ok(row)
            })
            .collect()
    }
}

/// Tables to replicate: `configured` when non-empty, otherwise every base
/// table the source reports. Names are checked before they reach any SQL.
pub async fn resolve_tables(
    source: &dyn SnapshotSource,
    configured: &[String],
) -> Result<Vec<String>> {
    let tables = if configured.is_empty() {
        let listed = source.list_tables().await?;
        info!(tables = listed.len(), "No table list configured, replicating all tables");
        listed
    } else {
        configured.to_vec()
    };

    for table in &tables {
        validate_identifier(table, "table name")?;
    }
    Ok(tables)
}

/// Converts `schema` and makes sure its target table (and, for CDC tables,
/// the live view) exists. With `drop_existing` the view and table are
/// dropped first.
pub(crate) async fn ensure_target_table(
    sink: &dyn BatchSink,
    schema: &TableSchema,
    database: &str,
    cdc: bool,
    drop_existing: bool,
) -> Result<TargetTableSchema> {
    let target = convert(schema, cdc)?;

    if drop_existing {
        info!(table = %schema.name, "Dropping existing target table");
        apply_ddl(sink, &schema.name, render_drop_view_statement(&target.name, database)).await?;
        apply_ddl(sink, &schema.name, render_drop_statement(&target.name, database)).await?;
    }

    apply_ddl(sink, &schema.name, render_create_statement(&target, database)).await?;
    if let Some(view) = render_view_statement(&target, database) {
        apply_ddl(sink, &schema.name, view).await?;
    }

    Ok(target)
}

async fn apply_ddl(sink: &dyn BatchSink, table: &str, statement: String) -> Result<()> {
    debug!(statement = %statement, "Executing DDL");
    sink.execute_ddl(&statement)
        .await
        .map_err(|e| Error::sink(table, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, rows: u64, error: Option<&str>) -> TableReport {
        TableReport {
            table: name.to_string(),
            rows_written: rows,
            source_rows: Some(rows),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_report_totals_and_failures() {
        let report = SnapshotReport {
            tables: vec![
                table("users", 10, None),
                table("orders", 3, Some("Connection error: reset")),
                table("items", 7, None),
            ],
            elapsed: Duration::from_secs(1),
        };

        assert_eq!(report.total_rows(), 20);
        assert_eq!(report.failed(), vec!["orders".to_string()]);
        assert!(report.table("items").unwrap().is_success());
        assert!(report.table("missing").is_none());

        match report.into_result() {
            Err(Error::Snapshot { failed }) => assert_eq!(failed, vec!["orders".to_string()]),
            _ => panic!("expected snapshot error"),
        }
    }

    #[test]
    fn test_successful_report_passes_through() {
        let report = SnapshotReport {
            tables: vec![table("users", 1, None)],
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.into_result().unwrap().total_rows(), 1);
    }
}
