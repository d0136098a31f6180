//! Upload client for completed traffic records.

use std::time::Duration;

use thiserror::Error;

use muninn_model::TrafficLog;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("upload request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server rejected upload: status {0}")]
    Status(reqwest::StatusCode),
}

/// POSTs records to the collector's `/api/v1/upload` endpoint. Errors are
/// the caller's to log and drop — a failed upload must never stall
/// capture.
pub struct Reporter {
    client: reqwest::Client,
    url: String,
}

impl Reporter {
    pub fn new(url: String, timeout: Duration) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub async fn upload(&self, entry: &TrafficLog) -> Result<(), ReportError> {
        let response = self.client.post(&self.url).json(entry).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReportError::Status(status));
        }
        Ok(())
    }
}
