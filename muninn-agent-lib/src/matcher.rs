//! Best-effort HTTP/1.x request/response pairing.
//!
//! No TCP reassembly: a packet is classified by its first payload line
//! alone. A request-line split across segments is missed, and pipelined
//! requests on one connection collapse to latest-request-wins — accepted
//! trade-offs for a passive observer.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use ahash::AHashMap;
use chrono::{DateTime, TimeDelta, Utc};

use muninn_model::TrafficLog;

/// Decoded view of one captured frame. Borrows the TCP payload from the
/// ring buffer, so it is only valid until the next frame is pulled;
/// anything the matcher keeps is copied out.
#[derive(Debug, Clone, Copy)]
pub struct PacketMeta<'a> {
    pub timestamp: DateTime<Utc>,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
    /// Full wire length of the frame, not just the captured payload.
    pub packet_size: u64,
}

/// One direction of a TCP conversation, stored from the client's
/// perspective: requests insert under their own (src, dst) order and
/// responses look up with src/dst swapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    client_ip: Ipv4Addr,
    client_port: u16,
    server_ip: Ipv4Addr,
    server_port: u16,
}

#[derive(Debug, Clone)]
struct RequestState {
    captured_at: DateTime<Utc>,
    method: String,
    path: String,
}

/// Concurrency-safe map of outstanding requests awaiting a response.
///
/// The lock is held only for single map operations; the pipeline is
/// single-threaded today but the janitor may move to its own task.
pub struct HttpMatcher {
    requests: Mutex<AHashMap<FlowKey, RequestState>>,
    timeout: TimeDelta,
}

impl HttpMatcher {
    /// `timeout` bounds how long a request waits for its response;
    /// non-positive values fall back to 30 s.
    pub fn new(timeout: std::time::Duration) -> Self {
        let timeout =
            TimeDelta::from_std(timeout).unwrap_or_else(|_| TimeDelta::seconds(30));
        let timeout = if timeout <= TimeDelta::zero() {
            TimeDelta::seconds(30)
        } else {
            timeout
        };
        Self {
            requests: Mutex::new(AHashMap::with_capacity(1024)),
            timeout,
        }
    }

    /// Record `meta` as an outstanding request if its payload starts with
    /// an HTTP request-line. A newer request on the same 4-tuple replaces
    /// the older one. Returns whether the packet was recognized.
    pub fn observe_request(&self, meta: &PacketMeta<'_>) -> bool {
        let Some((method, path)) = parse_request_line(meta.payload) else {
            return false;
        };

        let key = FlowKey {
            client_ip: meta.src_ip,
            client_port: meta.src_port,
            server_ip: meta.dst_ip,
            server_port: meta.dst_port,
        };
        let state = RequestState {
            captured_at: meta.timestamp,
            method,
            path,
        };

        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.insert(key, state);
        true
    }

    /// Match `meta` against a stored request if its payload starts with an
    /// HTTP status-line. Returns the completed record, or `None` when the
    /// packet is not a response or no request is outstanding on the
    /// reversed 4-tuple.
    pub fn observe_response(&self, meta: &PacketMeta<'_>) -> Option<TrafficLog> {
        let status_code = parse_status_line(meta.payload)?;

        // The response flows server -> client; swap to the key the request
        // was stored under.
        let key = FlowKey {
            client_ip: meta.dst_ip,
            client_port: meta.dst_port,
            server_ip: meta.src_ip,
            server_port: meta.src_port,
        };

        let request = {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.remove(&key)?
        };

        let latency_ms = (meta.timestamp - request.captured_at)
            .num_milliseconds()
            .max(0);

        Some(TrafficLog {
            timestamp: request.captured_at,
            src_ip: meta.src_ip.to_string(),
            src_port: meta.src_port,
            dst_ip: meta.dst_ip.to_string(),
            dst_port: meta.dst_port,
            pid: 0,
            http_method: request.method,
            http_path: request.path,
            status_code,
            latency_ms,
            packet_size: meta.packet_size,
        })
    }

    /// Evict every request captured before `now - timeout`.
    pub fn cleanup(&self, now: DateTime<Utc>) {
        let deadline = now - self.timeout;
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.retain(|_, state| state.captured_at >= deadline);
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const METHODS: [&[u8]; 7] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
];

/// Everything before the first `\n`, trailing `\r` stripped; the whole
/// payload when no newline is present.
fn first_line(payload: &[u8]) -> &[u8] {
    let line = match payload.iter().position(|&b| b == b'\n') {
        Some(idx) => &payload[..idx],
        None => payload,
    };
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// Runs of ASCII whitespace separate tokens; operates on raw bytes so
/// non-UTF-8 payloads cannot fail, only mismatch.
fn tokens(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|b| b.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
}

fn parse_request_line(payload: &[u8]) -> Option<(String, String)> {
    let line = first_line(payload);
    // Prefix check first: cheap rejection for the bulk of non-HTTP
    // payloads before any tokenization.
    if !METHODS.iter().any(|m| line.starts_with(m)) {
        return None;
    }

    let mut parts = tokens(line);
    let method = parts.next()?;
    let target = parts.next()?;
    Some((
        String::from_utf8_lossy(method).into_owned(),
        String::from_utf8_lossy(target).into_owned(),
    ))
}

fn parse_status_line(payload: &[u8]) -> Option<u16> {
    let line = first_line(payload);
    if !line.starts_with(b"HTTP/1.") {
        return None;
    }

    let mut parts = tokens(line);
    let _version = parts.next()?;
    let code = parts.next()?;
    std::str::from_utf8(code)
        .ok()?
        .parse::<u16>()
        .ok()
        .filter(|&c| c > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line_variants() {
        assert_eq!(first_line(b"GET / HTTP/1.1\r\nHost: x\r\n"), b"GET / HTTP/1.1");
        assert_eq!(first_line(b"GET / HTTP/1.1\nrest"), b"GET / HTTP/1.1");
        assert_eq!(first_line(b"no newline at all"), b"no newline at all");
        assert_eq!(first_line(b""), b"");
    }

    #[test]
    fn test_parse_request_line_accepts_known_methods() {
        for payload in [
            &b"GET /a HTTP/1.1\r\n"[..],
            b"POST /b HTTP/1.1\r\n",
            b"PUT /c HTTP/1.1\r\n",
            b"DELETE /d HTTP/1.1\r\n",
            b"HEAD /e HTTP/1.1\r\n",
            b"OPTIONS * HTTP/1.1\r\n",
            b"PATCH /f HTTP/1.1\r\n",
        ] {
            assert!(parse_request_line(payload).is_some(), "rejected {payload:?}");
        }
    }

    #[test]
    fn test_parse_request_line_rejects_lookalikes() {
        // Prefix requires the trailing space: "GETX" is not a method.
        assert!(parse_request_line(b"GETX / HTTP/1.1\r\n").is_none());
        // A method with no target has fewer than two tokens.
        assert!(parse_request_line(b"GET \r\n").is_none());
        assert!(parse_request_line(b"HTTP/1.1 200 OK\r\n").is_none());
        assert!(parse_request_line(b"").is_none());
    }

    #[test]
    fn test_parse_request_line_tolerates_non_utf8_target() {
        let payload = b"GET /\xff\xfe HTTP/1.1\r\n";
        let (method, path) = parse_request_line(payload).unwrap();
        assert_eq!(method, "GET");
        assert!(path.starts_with('/'));
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r\n"), Some(200));
        assert_eq!(parse_status_line(b"HTTP/1.0 404 Not Found\r\n"), Some(404));
        assert_eq!(parse_status_line(b"HTTP/1.1 abc\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/2 200\r\n"), None);
        assert_eq!(parse_status_line(b"SSH-2.0-OpenSSH_8.2p1\r\n"), None);
    }
}
