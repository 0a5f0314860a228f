pub mod checkpoint;
pub mod config;
pub mod error;
pub mod replicator;
pub mod schema;
pub mod sink;
pub mod snapshot;
pub mod source;
pub mod stream;

pub mod clickhouse;
pub mod mysql;

pub use config::Config;
pub use error::{Error, Result};
pub use replicator::{EngineState, ReplicationStats, Replicator};
pub use snapshot::{SnapshotReport, Snapshotter};
