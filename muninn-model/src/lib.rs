//! Types shared between the agent, the server, and the query client.
//!
//! `TrafficLog` is the wire schema: the agent POSTs it as JSON to
//! `/api/v1/upload`, the server stores and returns it from
//! `/api/v1/query`, and the client renders it. Field names are the
//! JSON contract — do not rename without versioning the API.
#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One matched HTTP/1.x request/response pair observed on the wire.
///
/// Directional convention: `src` is the **server** side (the response
/// source) and `dst` is the **client** side (the response destination),
/// regardless of which peer opened the TCP connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficLog {
    /// Capture time of the *request* packet.
    pub timestamp: DateTime<Utc>,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    /// PID of the local endpoint, 0 when attribution failed.
    #[serde(default)]
    pub pid: u32,
    pub http_method: String,
    pub http_path: String,
    pub status_code: u16,
    /// Response capture time minus request capture time, floored at 0.
    pub latency_ms: i64,
    /// Wire length of the response-bearing frame.
    pub packet_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_traffic_log_json_field_names() {
        let entry = TrafficLog {
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            src_ip: "10.0.0.1".to_string(),
            src_port: 80,
            dst_ip: "192.168.1.10".to_string(),
            dst_port: 12345,
            pid: 4242,
            http_method: "GET".to_string(),
            http_path: "/api/test".to_string(),
            status_code: 200,
            latency_ms: 100,
            packet_size: 54,
        };

        let json = serde_json::to_value(&entry).unwrap();
        for field in [
            "timestamp",
            "src_ip",
            "src_port",
            "dst_ip",
            "dst_port",
            "pid",
            "http_method",
            "http_path",
            "status_code",
            "latency_ms",
            "packet_size",
        ] {
            assert!(json.get(field).is_some(), "missing JSON field {field}");
        }
    }

    #[test]
    fn test_traffic_log_round_trip() {
        let entry = TrafficLog {
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            src_ip: "10.0.0.1".to_string(),
            src_port: 80,
            dst_ip: "192.168.1.10".to_string(),
            dst_port: 12345,
            pid: 0,
            http_method: "POST".to_string(),
            http_path: "/submit".to_string(),
            status_code: 204,
            latency_ms: 0,
            packet_size: 66,
        };

        let json = serde_json::to_string(&entry).unwrap();
        let back: TrafficLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_pid_defaults_to_zero_when_absent() {
        let json = r#"{
            "timestamp": "2026-01-02T03:04:05Z",
            "src_ip": "10.0.0.1", "src_port": 80,
            "dst_ip": "192.168.1.10", "dst_port": 12345,
            "http_method": "GET", "http_path": "/",
            "status_code": 200, "latency_ms": 1, "packet_size": 60
        }"#;
        let entry: TrafficLog = serde_json::from_str(json).unwrap();
        assert_eq!(entry.pid, 0);
    }
}
