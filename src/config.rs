use crate::replicator::ReplicatorOptions;
use crate::schema::validate_identifier;
use crate::snapshot::SnapshotOptions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "CH_CAPTURE";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub mysql: MySqlConfig,
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MySqlConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// File holding the password; wins over `password`.
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    pub database: String,
    /// Replica id announced when reading the binlog.
    #[serde(default = "default_server_id")]
    pub server_id: u32,
    /// Seconds of binlog silence after which the server sends a heartbeat.
    /// Zero leaves the server default.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    pub database: String,
    /// Gzip insert bodies.
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// One-time full copy.
    #[default]
    Snapshot,
    /// Snapshot followed by continuous change data capture.
    Cdc,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub mode: ReplicationMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Tables to replicate; empty means all tables.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub drop_existing: bool,
    #[serde(default = "default_parallel_tables")]
    pub parallel_tables: usize,
    #[serde(default = "default_position_file")]
    pub position_file: PathBuf,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::default(),
            batch_size: default_batch_size(),
            tables: Vec::new(),
            drop_existing: false,
            parallel_tables: default_parallel_tables(),
            position_file: default_position_file(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
        }
    }
}

impl Config {
    /// Loads the configuration from an optional TOML file, overridden by
    /// `CH_CAPTURE_*` environment variables (`__` separates nesting, e.g.
    /// `CH_CAPTURE_MYSQL__HOST`), then resolves password files.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("replication.tables")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let mut config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.resolve_secrets()?;
        Ok(config)
    }

    fn resolve_secrets(&mut self) -> Result<()> {
        if let Some(path) = &self.mysql.password_file {
            self.mysql.password = Some(read_secret(path)?);
        }
        if let Some(path) = &self.clickhouse.password_file {
            self.clickhouse.password = Some(read_secret(path)?);
        }
        Ok(())
    }

    /// Rejects configurations that cannot work, before any connection is
    /// made.
    pub fn validate(&self) -> Result<()> {
        if self.mysql.host.trim().is_empty() {
            return Err(Error::Config("mysql.host is required".to_string()));
        }
        if self.mysql.user.trim().is_empty() {
            return Err(Error::Config("mysql.user is required".to_string()));
        }
        validate_identifier(&self.mysql.database, "MySQL database name")?;
        validate_identifier(&self.clickhouse.database, "ClickHouse database name")?;

        if !(self.clickhouse.url.starts_with("http://") || self.clickhouse.url.starts_with("https://"))
        {
            return Err(Error::Config(format!(
                "clickhouse.url must be an http(s) URL, got '{}'",
                self.clickhouse.url
            )));
        }

        let replication = &self.replication;
        if replication.batch_size == 0 {
            return Err(Error::Config("replication.batch_size must be positive".to_string()));
        }
        if replication.parallel_tables == 0 {
            return Err(Error::Config(
                "replication.parallel_tables must be positive".to_string(),
            ));
        }
        if replication.checkpoint_interval_secs == 0 {
            return Err(Error::Config(
                "replication.checkpoint_interval_secs must be positive".to_string(),
            ));
        }
        if replication.position_file.as_os_str().is_empty() {
            return Err(Error::Config("replication.position_file is required".to_string()));
        }
        for table in &replication.tables {
            validate_identifier(table, "table name")?;
        }
        Ok(())
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.replication.checkpoint_interval_secs)
    }

    pub fn replicator_options(&self) -> ReplicatorOptions {
        ReplicatorOptions {
            database: self.clickhouse.database.clone(),
            tables: self.replication.tables.clone(),
            batch_size: self.replication.batch_size,
            parallelism: self.replication.parallel_tables,
            drop_existing: self.replication.drop_existing,
            checkpoint_interval: self.checkpoint_interval(),
            position_file: self.replication.position_file.clone(),
        }
    }

    /// Options for a plain (non-CDC) snapshot run.
    pub fn snapshot_options(&self) -> SnapshotOptions {
        SnapshotOptions {
            database: self.clickhouse.database.clone(),
            batch_size: self.replication.batch_size,
            parallelism: self.replication.parallel_tables,
            drop_existing: self.replication.drop_existing,
            cdc_version: None,
        }
    }
}

fn read_secret(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read password file {:?}: {}", path, e))
    })?;
    Ok(content.trim_end_matches(['\r', '\n']).to_string())
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_server_id() -> u32 {
    100
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_user() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    50_000
}

fn default_parallel_tables() -> usize {
    1
}

fn default_position_file() -> PathBuf {
    PathBuf::from("/data/binlog_position.json")
}

fn default_checkpoint_interval_secs() -> u64 {
    5
}
