//! Published-reproduction listing from the reproduction API.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the listing API.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ListingError {
    #[error("Listing request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Listing API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid listing response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ListingError {
    /// Network errors, 5xx, and 429 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_decode() && !e.is_builder(),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Parse(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    reproductions: Vec<Reproduction>,
}

#[derive(Debug, Deserialize)]
struct Reproduction {
    repro_id: String,
}

/// Client for `GET {base}/reproductions`.
pub(crate) struct ListingClient {
    http: reqwest::Client,
    base_url: String,
    backoff: Duration,
}

impl ListingClient {
    pub fn new(base_url: &str) -> Result<Self, ListingError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            backoff: Duration::from_secs(1),
        })
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Ids of the `limit` most recent published reproductions.
    ///
    /// Retries transient failures with delays of 2 and 4 backoff units.
    pub async fn fetch_latest(&self, limit: usize) -> Result<Vec<String>, ListingError> {
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << attempt);
                debug!(
                    "Listing retry attempt {} after {:?} delay",
                    attempt + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            attempt += 1;

            match self.fetch_once(limit).await {
                Ok(ids) => return Ok(ids),
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!("Listing attempt {} failed: {}", attempt, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, limit: usize) -> Result<Vec<String>, ListingError> {
        let url = format!("{}/reproductions", self.base_url);
        let limit = limit.to_string();
        debug!("Fetching {} (limit {})", url, limit);

        let response = self
            .http
            .get(&url)
            .query(&[("status", "published"), ("limit", limit.as_str())])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ListingError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_listing(&body)
    }
}

/// Extracts `reproductions[].repro_id` from a listing body.
pub(crate) fn parse_listing(body: &str) -> Result<Vec<String>, ListingError> {
    let listing: ListingResponse = serde_json::from_str(body)?;
    Ok(listing
        .reproductions
        .into_iter()
        .map(|r| r.repro_id)
        .collect())
}
