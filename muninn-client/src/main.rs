//! Query CLI: fetch traffic logs from the collector and print them as an
//! aligned table.

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::{ArgGroup, Parser};
use tracing::error;
use tracing_subscriber::EnvFilter;

use muninn_model::TrafficLog;

#[derive(Parser, Debug)]
#[command(author, version, about = "muninn query client")]
#[command(group(
    ArgGroup::new("selector").required(true).multiple(true).args(["ip", "pid"])
))]
struct Cli {
    /// Filter by IPv4 address (matches either side of the flow)
    #[arg(long)]
    ip: Option<Ipv4Addr>,

    /// Filter by process id; wins when both filters are given
    #[arg(long)]
    pid: Option<u32>,

    /// Collector base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Maximum rows to fetch (server clamps to 2000)
    #[arg(long)]
    limit: Option<u32>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(rows) => print!("{}", render_table(&rows)),
        Err(err) => {
            error!(%err, "query failed");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<Vec<TrafficLog>, Box<dyn std::error::Error + Send + Sync>> {
    let mut url = reqwest::Url::parse(&cli.server)?.join("/api/v1/query")?;
    {
        let mut pairs = url.query_pairs_mut();
        match (cli.pid, cli.ip) {
            (Some(pid), _) => {
                pairs.append_pair("pid", &pid.to_string());
            }
            (None, Some(ip)) => {
                pairs.append_pair("ip", &ip.to_string());
            }
            // clap's selector group guarantees one of the two.
            (None, None) => unreachable!("selector group requires ip or pid"),
        }
        if let Some(limit) = cli.limit {
            pairs.append_pair("limit", &limit.to_string());
        }
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("server returned {status}: {body}").into());
    }

    Ok(response.json().await?)
}

const HEADERS: [&str; 9] = [
    "Time",
    "PID",
    "Source",
    "Destination",
    "Method",
    "Path",
    "Status",
    "Latency(ms)",
    "Size",
];

fn row_cells(entry: &TrafficLog) -> [String; 9] {
    [
        entry.timestamp.to_rfc3339(),
        entry.pid.to_string(),
        format!("{}:{}", entry.src_ip, entry.src_port),
        format!("{}:{}", entry.dst_ip, entry.dst_port),
        entry.http_method.clone(),
        entry.http_path.clone(),
        entry.status_code.to_string(),
        entry.latency_ms.to_string(),
        entry.packet_size.to_string(),
    ]
}

/// Plain-text table with per-column widths computed over all rows.
fn render_table(rows: &[TrafficLog]) -> String {
    let cells: Vec<[String; 9]> = rows.iter().map(row_cells).collect();

    let mut widths: Vec<usize> = HEADERS.iter().map(|h| h.len()).collect();
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let render_row = |out: &mut String, cells: &[&str]| {
        for (i, (cell, width)) in cells.iter().zip(&widths).enumerate() {
            if i > 0 {
                out.push_str("  ");
            }
            out.push_str(cell);
            out.extend(std::iter::repeat(' ').take(width - cell.len()));
        }
        // No trailing padding after the last column.
        while out.ends_with(' ') {
            out.pop();
        }
        out.push('\n');
    };

    render_row(&mut out, &HEADERS);
    for row in &cells {
        let refs: Vec<&str> = row.iter().map(String::as_str).collect();
        render_row(&mut out, &refs);
    }
    out
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
