//! Change stream consumer.

use crate::checkpoint::BinlogPosition;
use crate::schema::TableSchema;
use crate::source::{ChangeEvent, ChangeFeed, ChangeSource, FeedEvent};
use crate::Result;
use std::collections::HashSet;
use tracing::{debug, info, trace, warn};

/// Ordered, restartable sequence of [`ChangeEvent`]s for the replicated
/// tables.
///
/// Feeds reopen at transaction boundaries, so a resumed feed may replay rows
/// that were already delivered. Everything at or before the resume token is
/// dropped here, as are events for other tables and schema changes.
///
/// [`ChangeStream::consumed`] tracks the newest token read from the feed,
/// dropped events included, so an idle replication set does not pin the
/// saved position to an old binlog file.
pub struct ChangeStream {
    feed: Box<dyn ChangeFeed>,
    resume_after: Option<BinlogPosition>,
    tables: HashSet<String>,
    dropped: u64,
    consumed: Option<BinlogPosition>,
}

impl ChangeStream {
    /// Opens the source feed at `from`, or at the head when `from` is `None`.
    pub async fn open(
        source: &dyn ChangeSource,
        from: Option<&BinlogPosition>,
        tables: &[TableSchema],
    ) -> Result<Self> {
        match from {
            Some(position) => info!(position = %position, "Opening change feed"),
            None => info!("Opening change feed at head"),
        }
        let feed = source.open_feed(from, tables).await?;
        Ok(Self::new(
            feed,
            from.cloned(),
            tables.iter().map(|t| t.name.clone()),
        ))
    }

    pub fn new(
        feed: Box<dyn ChangeFeed>,
        resume_after: Option<BinlogPosition>,
        tables: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            feed,
            resume_after,
            tables: tables.into_iter().collect(),
            dropped: 0,
            consumed: None,
        }
    }

    /// Token of the newest event read past the resume point. Every event up
    /// to it has been either returned by [`ChangeStream::next`] or dropped.
    pub fn consumed(&self) -> Option<&BinlogPosition> {
        self.consumed.as_ref()
    }

    /// Number of feed events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next change for a replicated table. `None` once the feed ends.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        loop {
            let event = match self.feed.next_event().await? {
                Ok(event) => event,
                Err(e) => return Some(Err(e)),
            };

            if let Some(resume) = &self.resume_after {
                if event.token() <= resume {
                    trace!(token = %event.token(), "Skipping already replicated event");
                    self.dropped += 1;
                    continue;
                }
            }
            if self.consumed.as_ref().map_or(true, |seen| event.token() > seen) {
                self.consumed = Some(event.token().clone());
            }

            match event {
                FeedEvent::Schema { query, token } => {
                    warn!(
                        token = %token,
                        query = %query,
                        "Ignoring schema change; target tables are not altered"
                    );
                    self.dropped += 1;
                }
                FeedEvent::Boundary { token } => trace!(token = %token, "Transaction boundary"),
                FeedEvent::Change(change) if !self.tables.contains(&change.table) => {
                    debug!(table = %change.table, "Skipping event for unreplicated table");
                    self.dropped += 1;
                }
                FeedEvent::Change(change) => return Some(Ok(change)),
            }
        }
    }
}
