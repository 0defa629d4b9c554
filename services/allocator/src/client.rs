//! HTTP client for the upstream commit endpoint.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::commit::{CommitEndpoint, CommitError, CommitRequest, CommitResponse};

/// Commits reservations with `POST {base_url}/api/reserve`.
pub struct HttpCommitEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCommitEndpoint {
    /// Create a client. `timeout` bounds each request at the transport level.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CommitError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CommitError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn reserve_url(&self) -> String {
        format!("{}/api/reserve", self.base_url)
    }
}

#[async_trait]
impl CommitEndpoint for HttpCommitEndpoint {
    async fn commit(&self, request: &CommitRequest) -> Result<CommitResponse, CommitError> {
        let url = self.reserve_url();
        debug!(
            url = %url,
            pool_id = %request.pool_id,
            phase = %request.phase,
            "Sending commit request"
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Commit endpoint returned an error");
            return Err(CommitError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: CommitResponse = response
            .json()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CommitError::Timeout
                } else {
                    CommitError::Decode(e.to_string())
                }
            })?;
        debug!(
            pool_id = %request.pool_id,
            outcome = ?body.outcome,
            reservation_id = ?body.reservation_id,
            "Commit response received"
        );

        Ok(body)
    }
}

fn transport_error(e: reqwest::Error) -> CommitError {
    if e.is_timeout() {
        CommitError::Timeout
    } else {
        CommitError::Transport(e.to_string())
    }
}
