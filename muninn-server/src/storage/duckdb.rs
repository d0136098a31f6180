use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use duckdb::{params, Connection};

use muninn_model::TrafficLog;

use super::{StorageError, Store};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS traffic_logs (
    timestamp   TIMESTAMP,
    src_ip      VARCHAR,
    src_port    INTEGER,
    dst_ip      VARCHAR,
    dst_port    INTEGER,
    pid         BIGINT,
    http_method VARCHAR,
    http_path   VARCHAR,
    status_code INTEGER,
    latency_ms  BIGINT,
    packet_size BIGINT
)";

const INSERT: &str = "
INSERT INTO traffic_logs (
    timestamp, src_ip, src_port, dst_ip, dst_port, pid,
    http_method, http_path, status_code, latency_ms, packet_size
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const SELECT_BY_IP: &str = "
SELECT timestamp, src_ip, src_port, dst_ip, dst_port, pid,
       http_method, http_path, status_code, latency_ms, packet_size
FROM traffic_logs
WHERE src_ip = ? OR dst_ip = ?
ORDER BY timestamp DESC
LIMIT ?";

const SELECT_BY_PID: &str = "
SELECT timestamp, src_ip, src_port, dst_ip, dst_port, pid,
       http_method, http_path, status_code, latency_ms, packet_size
FROM traffic_logs
WHERE pid = ?
ORDER BY timestamp DESC
LIMIT ?";

/// DuckDB-backed store — the default driver; single file, embedded,
/// column-oriented, which fits append-mostly logs with analytical reads.
pub struct DuckdbStore {
    conn: Mutex<Connection>,
}

impl DuckdbStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn row_to_log(row: &duckdb::Row<'_>) -> duckdb::Result<TrafficLog> {
    Ok(TrafficLog {
        timestamp: row.get::<_, DateTime<Utc>>(0)?,
        src_ip: row.get(1)?,
        src_port: row.get(2)?,
        dst_ip: row.get(3)?,
        dst_port: row.get(4)?,
        pid: row.get(5)?,
        http_method: row.get(6)?,
        http_path: row.get(7)?,
        status_code: row.get(8)?,
        latency_ms: row.get(9)?,
        packet_size: row.get(10)?,
    })
}

impl Store for DuckdbStore {
    fn insert(&self, entry: &TrafficLog) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            INSERT,
            params![
                entry.timestamp,
                entry.src_ip,
                entry.src_port,
                entry.dst_ip,
                entry.dst_port,
                entry.pid,
                entry.http_method,
                entry.http_path,
                entry.status_code,
                entry.latency_ms,
                entry.packet_size,
            ],
        )?;
        Ok(())
    }

    fn query_by_ip(&self, ip: &str, limit: usize) -> Result<Vec<TrafficLog>, StorageError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(SELECT_BY_IP)?;
        let rows = stmt.query_map(params![ip, ip, limit as i64], row_to_log)?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }

    fn query_by_pid(&self, pid: u32, limit: usize) -> Result<Vec<TrafficLog>, StorageError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(SELECT_BY_PID)?;
        let rows = stmt.query_map(params![pid, limit as i64], row_to_log)?;
        Ok(rows.collect::<duckdb::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // DuckDB timestamps are microsecond precision; keep test stamps there.
    fn sample(ts_secs: u32, src_ip: &str, pid: u32) -> TrafficLog {
        TrafficLog {
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, ts_secs).unwrap(),
            src_ip: src_ip.to_string(),
            src_port: 80,
            dst_ip: "192.168.1.10".to_string(),
            dst_port: 12345,
            pid,
            http_method: "GET".to_string(),
            http_path: "/".to_string(),
            status_code: 200,
            latency_ms: 5,
            packet_size: 60,
        }
    }

    #[test]
    fn test_insert_and_query_round_trip() {
        let store = DuckdbStore::open_in_memory().unwrap();
        let entry = sample(1, "10.0.0.1", 42);
        store.insert(&entry).unwrap();

        let rows = store.query_by_ip("10.0.0.1", 200).unwrap();
        assert_eq!(rows, vec![entry.clone()]);
        let rows = store.query_by_pid(42, 200).unwrap();
        assert_eq!(rows, vec![entry]);
    }

    #[test]
    fn test_query_orders_newest_first_and_limits() {
        let store = DuckdbStore::open_in_memory().unwrap();
        for secs in [5, 15, 10] {
            store.insert(&sample(secs, "10.0.0.1", 0)).unwrap();
        }

        let rows = store.query_by_ip("10.0.0.1", 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp.timestamp() % 60, 15);
        assert_eq!(rows[1].timestamp.timestamp() % 60, 10);
    }
}
