//! Embedded storage behind one trait; the driver is chosen at startup.

mod duckdb;
mod sqlite;

pub use duckdb::DuckdbStore;
pub use sqlite::SqliteStore;

use muninn_model::TrafficLog;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("duckdb: {0}")]
    Duckdb(#[from] ::duckdb::Error),
}

/// Storage operations the API needs. Both drivers keep one
/// `traffic_logs` table and return rows newest-first.
pub trait Store: Send + Sync {
    fn insert(&self, entry: &TrafficLog) -> Result<(), StorageError>;
    fn query_by_ip(&self, ip: &str, limit: usize) -> Result<Vec<TrafficLog>, StorageError>;
    fn query_by_pid(&self, pid: u32, limit: usize) -> Result<Vec<TrafficLog>, StorageError>;
}
