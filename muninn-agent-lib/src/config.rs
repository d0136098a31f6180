use std::net::Ipv4Addr;
use std::time::Duration;

/// Runtime configuration for the agent pipeline.
///
/// Assembled from CLI flags by the `muninn-agent` binary; the library
/// does not read the environment itself.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Interface to capture on; `"any"` captures on all interfaces.
    pub interface: String,
    /// Where completed records are uploaded.
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    /// How long an unanswered request stays in the matcher before the
    /// janitor evicts it.
    pub request_timeout: Duration,
    /// Per-request deadline for the upload POST.
    pub upload_timeout: Duration,
    /// Maximum bytes captured per frame (rounded up to a power of two and
    /// clamped by the ring).
    pub snaplen: u32,
    /// Skip loading the eBPF PID resolver; records carry pid 0.
    pub pid_resolver: bool,
}

impl AgentConfig {
    pub fn upload_url(&self) -> String {
        format!(
            "http://{}:{}/api/v1/upload",
            self.server_ip, self.server_port
        )
    }
}

/// Parse a human duration flag value: `30s`, `250ms`, `2m`, or a bare
/// number of seconds.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {raw:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit in {raw:?} (use ms/s/m/h)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("ms").is_err());
    }

    #[test]
    fn test_upload_url() {
        let cfg = AgentConfig {
            interface: "eth0".to_string(),
            server_ip: Ipv4Addr::new(10, 0, 0, 5),
            server_port: 8080,
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(5),
            snaplen: 65535,
            pid_resolver: true,
        };
        assert_eq!(cfg.upload_url(), "http://10.0.0.5:8080/api/v1/upload");
    }
}
