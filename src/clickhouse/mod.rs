//! ClickHouse sink adapter over the HTTP interface.

mod client;

pub use client::ClickHouseClient;

use crate::config::ClickHouseConfig;
use crate::schema::validate_identifier;
use crate::sink::{BatchSink, SinkError};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

/// [`BatchSink`] writing into one ClickHouse database.
pub struct ClickHouseSink {
    client: ClickHouseClient,
    database: String,
}

impl ClickHouseSink {
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        validate_identifier(&config.database, "ClickHouse database name")?;
        info!(
            url = %config.url,
            database = %config.database,
            compression = config.compression,
            "Configured ClickHouse sink"
        );
        Ok(Self {
            client: ClickHouseClient::new(config)?,
            database: config.database.clone(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

#[async_trait]
impl BatchSink for ClickHouseSink {
    async fn execute_ddl(&self, statement: &str) -> std::result::Result<(), SinkError> {
        self.client.execute(statement).await
    }

    async fn write(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> std::result::Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.client
            .insert(&self.database, table, columns, rows)
            .await
    }
}
