use crate::checkpoint::BinlogPosition;
use crate::config::MySqlConfig;
use crate::schema::{validate_identifier, ColumnDescriptor, SourceKind, SourceType, TableSchema};
use crate::{Error, Result};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row};
use tracing::{debug, info, warn};

const COLUMNS_QUERY: &str = "SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE, NUMERIC_PRECISION, \
     NUMERIC_SCALE, CHARACTER_MAXIMUM_LENGTH, COLUMN_TYPE \
     FROM INFORMATION_SCHEMA.COLUMNS \
     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
     ORDER BY ORDINAL_POSITION";

const PRIMARY_KEY_QUERY: &str = "SELECT COLUMN_NAME \
     FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
     ORDER BY ORDINAL_POSITION";

const TABLES_QUERY: &str = "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
     WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE' \
     ORDER BY TABLE_NAME";

/// Pooled access to the source database.
#[derive(Clone)]
pub struct SourceConnection {
    pool: Pool,
    opts: Opts,
    database: String,
}

type ColumnRow = (
    String,
    String,
    String,
    Option<u64>,
    Option<u64>,
    Option<u64>,
    String,
);

impl SourceConnection {
    pub fn new(config: &MySqlConfig) -> Result<Self> {
        validate_identifier(&config.database, "MySQL database name")?;

        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(config.password.clone())
            .db_name(Some(config.database.clone()))
            .into();

        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Configured MySQL connection pool"
        );

        Ok(Self {
            pool: Pool::new(opts.clone()),
            opts,
            database: config.database.clone(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// A connection outside the pool, for the binlog stream which takes
    /// ownership of it.
    pub async fn dedicated(&self) -> Result<Conn> {
        Ok(Conn::new(self.opts.clone()).await?)
    }

    pub async fn list_tables(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let tables: Vec<String> = conn.exec(TABLES_QUERY, (self.database.as_str(),)).await?;
        debug!(tables = tables.len(), "Listed source tables");
        Ok(tables)
    }

    pub async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        validate_identifier(table, "table name")?;
        let mut conn = self.pool.get_conn().await?;

        let rows: Vec<ColumnRow> = conn
            .exec(COLUMNS_QUERY, (self.database.as_str(), table))
            .await?;
        if rows.is_empty() {
            return Err(Error::schema(
                table,
                format!("table not found in database '{}'", self.database),
            ));
        }

        let columns = rows
            .into_iter()
            .map(|(name, data_type, nullable, precision, scale, length, column_type)| {
                let mut source_type = SourceType::new(data_type);
                match source_type.kind() {
                    SourceKind::Decimal => {
                        if let (Some(p), Some(s)) = (precision, scale) {
                            source_type = source_type.with_precision(p as u32, s as u32);
                        }
                    }
                    SourceKind::Enum | SourceKind::Set => {
                        source_type = source_type.with_members(parse_members(&column_type));
                    }
                    _ => {}
                }
                if let Some(length) = length {
                    source_type = source_type.with_length(length);
                }
                ColumnDescriptor::new(name, source_type, nullable.eq_ignore_ascii_case("YES"))
            })
            .collect();

        let primary_key: Vec<String> = conn
            .exec(PRIMARY_KEY_QUERY, (self.database.as_str(), table))
            .await?;
        if primary_key.is_empty() {
            warn!(table = %table, "Table has no primary key, ordering by first column");
        }

        let schema = TableSchema::new(table, columns, primary_key);
        schema.validate()?;
        Ok(schema)
    }

    pub async fn row_count(&self, table: &str) -> Result<u64> {
        validate_identifier(table, "table name")?;
        let mut conn = self.pool.get_conn().await?;
        let count: Option<u64> = conn
            .query_first(format!("SELECT COUNT(*) FROM `{}`", table))
            .await?;
        Ok(count.unwrap_or(0))
    }

    /// Current binlog file and offset.
    pub async fn binlog_head(&self) -> Result<BinlogPosition> {
        let mut conn = self.pool.get_conn().await?;

        let row: Option<Row> = match conn.query_first("SHOW MASTER STATUS").await {
            Ok(row) => row,
            Err(mysql_async::Error::Server(e)) => {
                debug!(error = %e, "SHOW MASTER STATUS failed, trying SHOW BINARY LOG STATUS");
                conn.query_first("SHOW BINARY LOG STATUS").await?
            }
            Err(e) => return Err(e.into()),
        };

        let row = row.ok_or_else(|| Error::Replication {
            message: "binary logging is disabled on the source server".to_string(),
        })?;

        let file: Option<String> = row.get("File");
        let position: Option<u64> = row.get("Position");
        match (file, position) {
            (Some(file), Some(position)) => Ok(BinlogPosition::new(file, position)),
            _ => Err(Error::InvalidMessage {
                message: "binary log status is missing File or Position".to_string(),
            }),
        }
    }

    pub async fn disconnect(self) -> Result<()> {
        self.pool.disconnect().await?;
        Ok(())
    }
}

/// Labels declared in a `COLUMN_TYPE` such as `enum('a','it''s')`.
fn parse_members(column_type: &str) -> Vec<String> {
    let (Some(open), Some(close)) = (column_type.find('('), column_type.rfind(')')) else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }

    let mut members = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = column_type[open + 1..close].chars().peekable();
    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('\'', true) if chars.peek() == Some(&'\'') => {
                chars.next();
                current.push('\'');
            }
            ('\'', true) => {
                quoted = false;
                members.push(std::mem::take(&mut current));
            }
            ('\'', false) => quoted = true,
            (c, true) => current.push(c),
            _ => {}
        }
    }
    members
}
