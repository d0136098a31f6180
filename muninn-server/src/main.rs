mod api;
mod server;
mod storage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use storage::{DuckdbStore, SqliteStore, Store};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DbDriver {
    Duckdb,
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "muninn collector (traffic-log store + query API)")]
struct Cli {
    /// Address and port to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Embedded database driver
    #[arg(long, value_enum, default_value_t = DbDriver::Duckdb)]
    db_driver: DbDriver,

    /// Database file path; defaults to ./traffic.duckdb or ./traffic.db
    /// depending on the driver
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(|| match cli.db_driver {
        DbDriver::Duckdb => PathBuf::from("./traffic.duckdb"),
        DbDriver::Sqlite => PathBuf::from("./traffic.db"),
    });

    let store: Arc<dyn Store> = match cli.db_driver {
        DbDriver::Duckdb => match DuckdbStore::open(&db_path) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                error!(%err, path = %db_path.display(), "opening duckdb store failed");
                std::process::exit(1);
            }
        },
        DbDriver::Sqlite => match SqliteStore::open(&db_path) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                error!(%err, path = %db_path.display(), "opening sqlite store failed");
                std::process::exit(1);
            }
        },
    };
    info!(driver = ?cli.db_driver, path = %db_path.display(), "store opened");

    if let Err(err) = server::serve(cli.listen, store).await {
        error!(%err, "server exited with error");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
