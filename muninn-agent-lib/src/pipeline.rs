//! The agent's capture pipeline.
//!
//! One blocking loop drives the ring: pull a frame, decode, offer it to
//! the matcher as a request first and a response second, enrich matched
//! records with a PID, and push them to the async uploader over a bounded
//! channel. The janitor tick is interleaved at the top of the loop — the
//! ring's poll timeout guarantees the loop turns at least every 250 ms
//! even on an idle link.

use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use muninn_model::TrafficLog;

use crate::capture::{CaptureError, RingCapture};
use crate::config::AgentConfig;
use crate::decode::decode_frame;
use crate::error::{AgentError, Result};
use crate::filter::tcp_port80_filter;
use crate::matcher::HttpMatcher;
use crate::pidmap::PidResolver;
use crate::report::Reporter;

/// How often the janitor evicts stale requests, in seconds.
const CLEANUP_INTERVAL_SECS: i64 = 2;

/// Records buffered towards the uploader before capture starts dropping
/// them.
const UPLOAD_QUEUE_DEPTH: usize = 1024;

/// Run the pipeline until `cancel` fires or the packet source fails.
///
/// Teardown is LIFO: the capture loop returns, its end closes the upload
/// channel, the uploader drains, and dropping the resolver detaches the
/// tracepoint, program, and map.
pub async fn run(config: AgentConfig, cancel: CancellationToken) -> Result<()> {
    let mut capture = RingCapture::open(&config.interface, config.snaplen)?;
    capture.set_filter(&tcp_port80_filter())?;

    let resolver = if config.pid_resolver {
        match PidResolver::new() {
            Ok(resolver) => Some(resolver),
            Err(err) => {
                warn!(%err, "pid resolver unavailable; records will carry pid 0");
                None
            }
        }
    } else {
        info!("pid resolver disabled by configuration");
        None
    };

    let reporter = Reporter::new(config.upload_url(), config.upload_timeout)?;
    let matcher = HttpMatcher::new(config.request_timeout);
    let (tx, mut rx) = mpsc::channel::<TrafficLog>(UPLOAD_QUEUE_DEPTH);

    info!(
        interface = %config.interface,
        server = %format!("{}:{}", config.server_ip, config.server_port),
        "capture started"
    );

    let uploader = tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            if let Err(err) = reporter.upload(&entry).await {
                warn!(%err, "upload failed; record dropped");
            }
        }
    });

    let loop_cancel = cancel.clone();
    let capture_task = tokio::task::spawn_blocking(move || {
        capture_loop(&mut capture, &matcher, resolver.as_ref(), &tx, &loop_cancel)
    });

    let result = capture_task.await?;
    // The sender is gone; the uploader finishes the backlog and exits.
    uploader.await?;
    result
}

fn capture_loop(
    capture: &mut RingCapture,
    matcher: &HttpMatcher,
    resolver: Option<&PidResolver>,
    tx: &mpsc::Sender<TrafficLog>,
    cancel: &CancellationToken,
) -> Result<()> {
    let cleanup_interval = TimeDelta::seconds(CLEANUP_INTERVAL_SECS);
    let mut next_cleanup = Utc::now() + cleanup_interval;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let now = Utc::now();
        if now >= next_cleanup {
            matcher.cleanup(now);
            next_cleanup = now + cleanup_interval;
        }

        let frame = match capture.next_frame(cancel) {
            Ok(frame) => frame,
            Err(CaptureError::Cancelled) => return Ok(()),
            Err(err) => return Err(AgentError::Capture(err)),
        };

        let Some(meta) = decode_frame(frame.data, frame.info.timestamp, frame.info.wire_length)
        else {
            continue;
        };
        if meta.payload.is_empty() {
            continue;
        }

        // A payload is one or the other, never both: request recognition
        // takes priority.
        if matcher.observe_request(&meta) {
            continue;
        }
        let Some(mut entry) = matcher.observe_response(&meta) else {
            continue;
        };

        if let Some(resolver) = resolver {
            // The response packet is still in scope: src is the server
            // side, matching the emitted record's orientation.
            entry.pid = resolver.lookup(meta.src_ip, meta.src_port, meta.dst_ip, meta.dst_port);
        }

        match tx.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("upload queue full; dropping record");
            }
            // Uploader is gone; only happens during shutdown.
            Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
        }
    }
}
