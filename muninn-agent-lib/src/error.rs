use thiserror::Error;

use crate::capture::CaptureError;
use crate::report::ReportError;

/// Errors that can terminate the agent pipeline.
///
/// Recoverable conditions (non-HTTP payloads, unmatched responses, upload
/// failures, resolver misses) never surface here — the pipeline logs and
/// continues. Anything that does surface is fatal to the capture loop.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("packet capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("building upload client failed: {0}")]
    Report(#[from] ReportError),

    #[error("capture task panicked or was aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
