//! CDC engine.
//!
//! [`Replicator::run`] drives the whole replication lifecycle:
//!
//! 1. **Initializing**: load the saved [`Position`]. If there is one, go
//!    straight to streaming from it. Otherwise capture the head of the change
//!    log before any row is read.
//! 2. **Snapshotting**: copy every table into CDC target tables, then save
//!    the head captured in step 1.
//! 3. **Streaming**: pull change events, version them, batch them per table,
//!    and checkpoint (flush every batch, then save the position of the last
//!    flushed event) when a batch is full or the checkpoint timer fires.
//! 4. **ShuttingDown / Stopped**: on cancellation, flush and save one last
//!    time, then return.
//!
//! All batch state lives in a single [`CdcContext`] owned by the task running
//! `run`; the timer is just another branch of its `select!`.

use crate::checkpoint::{now_seconds, BinlogPosition, Position, PositionStore};
use crate::schema::{render_create_database, TableSchema, TargetTableSchema};
use crate::sink::BatchSink;
use crate::snapshot::{ensure_target_table, resolve_tables, SnapshotOptions, Snapshotter};
use crate::source::{ChangeEvent, ChangeOperation, ChangeSource, Row, SnapshotSource};
use crate::stream::ChangeStream;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle state of the engine, published through [`Replicator::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Snapshotting,
    Streaming,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Initializing => "initializing",
            EngineState::Snapshotting => "snapshotting",
            EngineState::Streaming => "streaming",
            EngineState::ShuttingDown => "shutting_down",
            EngineState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
    pub database: String,
    /// Tables to replicate; empty means every table of the source database.
    pub tables: Vec<String>,
    pub batch_size: usize,
    pub parallelism: usize,
    pub drop_existing: bool,
    pub checkpoint_interval: Duration,
    pub position_file: PathBuf,
}

/// Counters reported when the engine stops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationStats {
    pub snapshot_rows: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub rows_written: u64,
    pub checkpoints: u64,
    pub last_position: Option<BinlogPosition>,
}

impl ReplicationStats {
    pub fn events(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

/// Assigns `_version` values.
///
/// The version is the commit time in microseconds, or the wall clock when
/// the event has none. A candidate that is not above the previous version is
/// replaced by `previous + 1`, so versions strictly increase in feed order
/// and the later of two changes to a key always wins deduplication.
#[derive(Debug, Clone)]
pub struct VersionClock {
    last: u64,
}

impl VersionClock {
    pub fn new(last: u64) -> Self {
        Self { last }
    }

    pub fn next(&mut self, commit_time_micros: Option<u64>) -> u64 {
        let candidate = commit_time_micros.unwrap_or_else(now_micros);
        let version = if candidate > self.last {
            candidate
        } else {
            self.last.saturating_add(1)
        };
        self.last = version;
        version
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

/// Version stamped on snapshot rows: just below the first microsecond of the
/// second in which the head was captured, so any streamed change supersedes
/// the copied row.
pub fn snapshot_version(head_timestamp: f64) -> u64 {
    let seconds = head_timestamp.max(0.0).floor() as u64;
    seconds.saturating_mul(1_000_000).saturating_sub(1)
}

fn now_micros() -> u64 {
    (now_seconds() * 1_000_000.0) as u64
}

/// State of one streaming run.
pub struct CdcContext {
    sink: Arc<dyn BatchSink>,
    store: PositionStore,
    targets: BTreeMap<String, TargetTableSchema>,
    batches: BTreeMap<String, Vec<Row>>,
    batch_size: usize,
    clock: VersionClock,
    /// Token of the newest event held in `batches` (or already flushed).
    last_token: Option<BinlogPosition>,
    saved_token: Option<BinlogPosition>,
    stats: ReplicationStats,
}

impl CdcContext {
    pub fn new(
        sink: Arc<dyn BatchSink>,
        store: PositionStore,
        targets: impl IntoIterator<Item = TargetTableSchema>,
        batch_size: usize,
        clock: VersionClock,
        saved_token: Option<BinlogPosition>,
    ) -> Self {
        Self {
            sink,
            store,
            targets: targets.into_iter().map(|t| (t.name.clone(), t)).collect(),
            batches: BTreeMap::new(),
            batch_size: batch_size.max(1),
            clock,
            last_token: saved_token.clone(),
            saved_token,
            stats: ReplicationStats::default(),
        }
    }

    pub fn pending_rows(&self) -> usize {
        self.batches.values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> &ReplicationStats {
        &self.stats
    }

    /// Moves the position to save up to `token`, a feed position read after
    /// every event already applied. Events between the two were dropped, so
    /// nothing unwritten sits before it.
    pub fn observe(&mut self, token: &BinlogPosition) {
        if self.last_token.as_ref().map_or(true, |last| token > last) {
            self.last_token = Some(token.clone());
        }
    }

    /// Whether a checkpoint would write rows or move the saved position.
    pub fn has_unsaved_progress(&self) -> bool {
        self.pending_rows() > 0 || self.last_token != self.saved_token
    }

    /// Turns `event` into a versioned row and appends it to its table batch.
    /// Returns `true` when that batch reached the batch size.
    pub fn apply(&mut self, event: ChangeEvent) -> Result<bool> {
        let target = self
            .targets
            .get(&event.table)
            .ok_or_else(|| Error::Replication {
                message: format!("received change for unknown table '{}'", event.table),
            })?;
        let image = event.image().ok_or_else(|| Error::InvalidMessage {
            message: format!(
                "{:?} event for table '{}' at {} carries no row image",
                event.op, event.table, event.token
            ),
        })?;

        let version = self.clock.next(event.commit_time_micros);
        let deleted: u8 = if event.is_delete() { 1 } else { 0 };

        let mut row = Vec::with_capacity(target.columns.len());
        for column in target.source_columns() {
            let value = image
                .get(&column.name)
                .cloned()
                .unwrap_or_else(|| column.default_value());
            row.push(value);
        }
        row.push(Value::from(version));
        row.push(Value::from(deleted));

        match event.op {
            ChangeOperation::Insert => self.stats.inserts += 1,
            ChangeOperation::Update => self.stats.updates += 1,
            ChangeOperation::Delete => self.stats.deletes += 1,
        }

        let batch = self.batches.entry(event.table).or_default();
        batch.push(row);
        let full = batch.len() >= self.batch_size;
        self.last_token = Some(event.token);
        Ok(full)
    }

    /// Writes every pending batch, then saves the position of the newest
    /// written event. The position is never saved if a write fails.
    pub async fn checkpoint(&mut self) -> Result<()> {
        let mut written = 0;
        for (table, rows) in self.batches.iter_mut() {
            if rows.is_empty() {
                continue;
            }
            let Some(target) = self.targets.get(table) else {
                continue;
            };
            let columns = target.column_names();
            self.sink
                .write(table, &columns, rows)
                .await
                .map_err(|e| Error::sink(table.as_str(), e))?;
            debug!(table = %table, rows = rows.len(), "Flushed batch");
            written += rows.len() as u64;
            rows.clear();
        }
        self.stats.rows_written += written;

        let Some(token) = self.last_token.clone() else {
            return Ok(());
        };
        if self.saved_token.as_ref() == Some(&token) {
            return Ok(());
        }

        let position = Position::new(token.clone()).with_last_version(self.clock.last());
        self.store.save(&position).await?;
        self.saved_token = Some(token.clone());
        self.stats.checkpoints += 1;
        self.stats.last_position = Some(token.clone());
        info!(position = %token, rows = written, "Checkpoint saved");
        Ok(())
    }

    fn into_stats(self) -> ReplicationStats {
        self.stats
    }
}

/// The CDC engine.
///
/// # Example
///
/// ```rust,no_run
/// use ch_capture::clickhouse::ClickHouseSink;
/// use ch_capture::mysql::MySqlSource;
/// use ch_capture::{Config, Replicator};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example(config: Config) -> ch_capture::Result<()> {
/// let source = Arc::new(MySqlSource::new(&config.mysql)?);
/// let sink = Arc::new(ClickHouseSink::new(&config.clickhouse)?);
/// let replicator = Replicator::new(source, sink, config.replicator_options());
///
/// let stats = replicator.run(CancellationToken::new()).await?;
/// println!("replicated {} events", stats.events());
/// # Ok(())
/// # }
/// ```
pub struct Replicator {
    snapshot_source: Arc<dyn SnapshotSource>,
    change_source: Arc<dyn ChangeSource>,
    sink: Arc<dyn BatchSink>,
    options: ReplicatorOptions,
    state: watch::Sender<EngineState>,
}

impl Replicator {
    pub fn new<S>(source: Arc<S>, sink: Arc<dyn BatchSink>, options: ReplicatorOptions) -> Self
    where
        S: SnapshotSource + ChangeSource + 'static,
    {
        let (state, _) = watch::channel(EngineState::Initializing);
        Self {
            snapshot_source: source.clone(),
            change_source: source,
            sink,
            options,
            state,
        }
    }

    /// Watches the engine state.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    fn transition(&self, next: EngineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Engine state changed");
        }
    }

    /// Runs until `shutdown` is cancelled or the change feed ends.
    ///
    /// Every error is fatal: the state moves to `Stopped` and the error is
    /// returned without saving a position past unwritten data.
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ReplicationStats> {
        self.transition(EngineState::Initializing);
        let result = self.run_inner(&shutdown).await;
        if let Err(e) = &result {
            match e {
                Error::Shutdown => info!("Replication interrupted by shutdown"),
                _ => error!(error = %e, "Replication stopped"),
            }
        }
        self.transition(EngineState::Stopped);
        result
    }

    async fn run_inner(&self, shutdown: &CancellationToken) -> Result<ReplicationStats> {
        let mut store = PositionStore::new(&self.options.position_file);
        let saved = store.load().await?;

        let tables = resolve_tables(self.snapshot_source.as_ref(), &self.options.tables).await?;
        if tables.is_empty() {
            return Err(Error::Config("no tables to replicate".to_string()));
        }

        let (resume, clock, snapshot_rows) = match saved {
            Some(position) => {
                info!(
                    position = %position.position_token,
                    last_version = position.last_version,
                    "Resuming from saved position, skipping snapshot"
                );
                (
                    position.position_token,
                    VersionClock::new(position.last_version),
                    0,
                )
            }
            None => {
                let (head, version, rows) = self.snapshot(&tables, &mut store, shutdown).await?;
                (head, VersionClock::new(version), rows)
            }
        };

        let schemas = self.introspect(&tables).await?;
        let targets = self.prepare_targets(&schemas).await?;

        let mut context = CdcContext::new(
            Arc::clone(&self.sink),
            store,
            targets,
            self.options.batch_size,
            clock,
            Some(resume.clone()),
        );
        context.stats.snapshot_rows = snapshot_rows;
        context.stats.last_position = Some(resume.clone());

        if shutdown.is_cancelled() {
            self.transition(EngineState::ShuttingDown);
            return Ok(context.into_stats());
        }

        self.transition(EngineState::Streaming);
        let stream =
            ChangeStream::open(self.change_source.as_ref(), Some(&resume), &schemas).await?;
        self.stream(stream, &mut context, shutdown).await?;

        self.transition(EngineState::ShuttingDown);
        context.checkpoint().await?;

        let stats = context.into_stats();
        info!(
            inserts = stats.inserts,
            updates = stats.updates,
            deletes = stats.deletes,
            rows_written = stats.rows_written,
            checkpoints = stats.checkpoints,
            "Replication stopped cleanly"
        );
        Ok(stats)
    }

    /// Captures the head, copies all tables, and saves the head.
    /// Returns the head, the snapshot version and the copied row count.
    async fn snapshot(
        &self,
        tables: &[String],
        store: &mut PositionStore,
        shutdown: &CancellationToken,
    ) -> Result<(BinlogPosition, u64, u64)> {
        let head = Position::new(self.change_source.current_position().await?);
        let version = snapshot_version(head.timestamp);
        info!(
            head = %head.position_token,
            version,
            "No saved position, starting initial snapshot"
        );

        self.transition(EngineState::Snapshotting);
        let options = SnapshotOptions {
            database: self.options.database.clone(),
            batch_size: self.options.batch_size,
            parallelism: self.options.parallelism,
            drop_existing: self.options.drop_existing,
            cdc_version: Some(version),
        };
        let report = Snapshotter::new(
            Arc::clone(&self.snapshot_source),
            Arc::clone(&self.sink),
            options,
        )
        .run(tables, shutdown.clone())
        .await?;

        if shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let report = report.into_result()?;

        store.save(&head.clone().with_last_version(version)).await?;
        info!(position = %head.position_token, "Snapshot position saved");
        Ok((head.position_token, version, report.total_rows()))
    }

    async fn introspect(&self, tables: &[String]) -> Result<Vec<TableSchema>> {
        let mut schemas = Vec::with_capacity(tables.len());
        for table in tables {
            schemas.push(self.snapshot_source.table_schema(table).await?);
        }
        Ok(schemas)
    }

    /// Converts the schemas into CDC targets. Creates missing tables and
    /// views without dropping anything.
    async fn prepare_targets(&self, schemas: &[TableSchema]) -> Result<Vec<TargetTableSchema>> {
        let database = &self.options.database;
        self.sink
            .execute_ddl(&render_create_database(database))
            .await
            .map_err(|e| Error::sink(database.as_str(), e))?;

        let mut targets = Vec::with_capacity(schemas.len());
        for schema in schemas {
            targets.push(
                ensure_target_table(self.sink.as_ref(), schema, database, true, false).await?,
            );
        }
        Ok(targets)
    }

    async fn stream(
        &self,
        mut stream: ChangeStream,
        context: &mut CdcContext,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let period = self.options.checkpoint_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(pending = context.pending_rows(), "Shutdown requested, flushing");
                    observe_feed(&stream, context);
                    return Ok(());
                }

                _ = ticker.tick() => {
                    observe_feed(&stream, context);
                    if context.has_unsaved_progress() {
                        debug!(pending = context.pending_rows(), "Checkpoint timer fired");
                        context.checkpoint().await?;
                    }
                }

                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        if context.apply(event)? {
                            debug!(pending = context.pending_rows(), "Batch full");
                            context.checkpoint().await?;
                            ticker.reset();
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        warn!(dropped = stream.dropped(), "Change feed ended");
                        observe_feed(&stream, context);
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn observe_feed(stream: &ChangeStream, context: &mut CdcContext) {
    if let Some(token) = stream.consumed() {
        context.observe(token);
    }
}
