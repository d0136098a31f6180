//! HTTP serving loop with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::api;
use crate::storage::Store;

/// Accept connections until SIGINT/SIGTERM. Each connection gets its own
/// task; in-flight requests on other connections are unaffected by one
/// connection failing.
pub async fn serve(
    addr: SocketAddr,
    store: Arc<dyn Store>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "collector listening");

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };

                let store = store.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let store = store.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(api::route(req, store).await)
                        }
                    });

                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(TokioIo::new(stream), service).await
                    {
                        warn!(?peer, %err, "connection error");
                    }
                });
            }
        }
    }

    info!("collector stopped");
    Ok(())
}
