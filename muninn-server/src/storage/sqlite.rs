use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use muninn_model::TrafficLog;

use super::{StorageError, Store};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS traffic_logs (
    timestamp   TIMESTAMP,
    src_ip      TEXT,
    src_port    INTEGER,
    dst_ip      TEXT,
    dst_port    INTEGER,
    pid         INTEGER,
    http_method TEXT,
    http_path   TEXT,
    status_code INTEGER,
    latency_ms  INTEGER,
    packet_size INTEGER
);
CREATE INDEX IF NOT EXISTS idx_traffic_src_ip ON traffic_logs(src_ip);
CREATE INDEX IF NOT EXISTS idx_traffic_dst_ip ON traffic_logs(dst_ip);
CREATE INDEX IF NOT EXISTS idx_traffic_pid    ON traffic_logs(pid);
";

const INSERT: &str = "
INSERT INTO traffic_logs (
    timestamp, src_ip, src_port, dst_ip, dst_port, pid,
    http_method, http_path, status_code, latency_ms, packet_size
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const SELECT_BY_IP: &str = "
SELECT timestamp, src_ip, src_port, dst_ip, dst_port, pid,
       http_method, http_path, status_code, latency_ms, packet_size
FROM traffic_logs
WHERE src_ip = ?1 OR dst_ip = ?1
ORDER BY timestamp DESC
LIMIT ?2";

const SELECT_BY_PID: &str = "
SELECT timestamp, src_ip, src_port, dst_ip, dst_port, pid,
       http_method, http_path, status_code, latency_ms, packet_size
FROM traffic_logs
WHERE pid = ?1
ORDER BY timestamp DESC
LIMIT ?2";

/// SQLite-backed store. The connection is not `Sync`, so it sits behind a
/// mutex; handler calls are short single statements.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
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

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrafficLog> {
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
        // rusqlite has no FromSql for u64; the column is a signed
        // 64-bit INTEGER.
        packet_size: row.get::<_, i64>(10)? as u64,
    })
}

impl Store for SqliteStore {
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
                entry.packet_size as i64,
            ],
        )?;
        Ok(())
    }

    fn query_by_ip(&self, ip: &str, limit: usize) -> Result<Vec<TrafficLog>, StorageError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(SELECT_BY_IP)?;
        let rows = stmt.query_map(params![ip, limit as i64], row_to_log)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn query_by_pid(&self, pid: u32, limit: usize) -> Result<Vec<TrafficLog>, StorageError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(SELECT_BY_PID)?;
        let rows = stmt.query_map(params![pid, limit as i64], row_to_log)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

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
    fn test_insert_and_query_by_ip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let entry = sample(1, "10.0.0.1", 0);
        store.insert(&entry).unwrap();

        // Matches on the src side and the dst side.
        let rows = store.query_by_ip("10.0.0.1", 200).unwrap();
        assert_eq!(rows, vec![entry.clone()]);
        let rows = store.query_by_ip("192.168.1.10", 200).unwrap();
        assert_eq!(rows, vec![entry]);

        assert!(store.query_by_ip("172.16.0.1", 200).unwrap().is_empty());
    }

    #[test]
    fn test_query_orders_newest_first_and_limits() {
        let store = SqliteStore::open_in_memory().unwrap();
        for secs in [5, 15, 10] {
            store.insert(&sample(secs, "10.0.0.1", 0)).unwrap();
        }

        let rows = store.query_by_ip("10.0.0.1", 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp.timestamp() % 60, 15);
        assert_eq!(rows[1].timestamp.timestamp() % 60, 10);
    }

    #[test]
    fn test_query_by_pid() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(&sample(1, "10.0.0.1", 42)).unwrap();
        store.insert(&sample(2, "10.0.0.2", 7)).unwrap();

        let rows = store.query_by_pid(42, 200).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pid, 42);
        assert!(store.query_by_pid(999, 200).unwrap().is_empty());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic.db");
        let store = SqliteStore::open(&path).unwrap();
        store.insert(&sample(1, "10.0.0.1", 0)).unwrap();
        drop(store);

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.query_by_ip("10.0.0.1", 200).unwrap().len(), 1);
    }
}
