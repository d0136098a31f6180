use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use muninn_agent_lib::config::{parse_duration, AgentConfig};
use muninn_agent_lib::capture::DEFAULT_SNAPLEN;

#[derive(Parser, Debug)]
#[command(author, version, about = "muninn capture agent (passive HTTP observability)")]
struct Cli {
    /// Interface to capture on (e.g. eth0); "any" captures on all
    /// interfaces
    #[arg(long)]
    interface: String,

    /// Collector server IP
    #[arg(long)]
    server_ip: Ipv4Addr,

    /// Collector server port
    #[arg(long)]
    server_port: u16,

    /// How long an unanswered request is kept before eviction
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    request_timeout: Duration,

    /// Deadline for each upload POST
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    upload_timeout: Duration,

    /// Maximum bytes captured per frame
    #[arg(long, default_value_t = DEFAULT_SNAPLEN)]
    snaplen: u32,

    /// Skip the eBPF PID resolver; records carry pid 0
    #[arg(long)]
    no_pid_resolver: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let config = AgentConfig {
        interface: cli.interface,
        server_ip: cli.server_ip,
        server_port: cli.server_port,
        request_timeout: cli.request_timeout,
        upload_timeout: cli.upload_timeout,
        snaplen: cli.snaplen,
        pid_resolver: !cli.no_pid_resolver,
    };

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    if let Err(err) = muninn_agent_lib::run(config, cancel).await {
        error!(%err, "agent exited with error");
        std::process::exit(1);
    }
    info!("agent shut down");
}

async fn watch_signals(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(%err, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(err) => {
            error!(%err, "failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
    cancel.cancel();
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
