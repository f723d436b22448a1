//! External issue tracker client.
//!
//! One batched lookup endpoint: the linker hands over every identifier it
//! found in PR text and gets back the subset the tracker knows about.

use reqwest::{header, Client};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Tracker API client configuration.
#[derive(Debug, Clone)]
pub struct TrackerClientConfig {
    pub base_url: String,
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for TrackerClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Issue record as returned by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub identifier: String,
    pub title: String,
    pub status: String,
    pub level: Option<String>,
}

#[derive(Debug, Serialize)]
struct IssueLookupRequest<'a> {
    identifiers: &'a [String],
}

#[derive(Debug, Deserialize)]
struct IssueLookupResponse {
    issues: Vec<RemoteIssue>,
}

/// External issue tracker client.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    client: Client,
    config: TrackerClientConfig,
}

impl TrackerClient {
    /// Create a new tracker client.
    pub fn new(config: TrackerClientConfig) -> Result<Self, SyncError> {
        let mut headers = header::HeaderMap::new();
        let token_value = header::HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| SyncError::invalid_input("Invalid tracker token format"))?;
        headers.insert(header::AUTHORIZATION, token_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Look up issues by identifier in a single batched call.
    ///
    /// Unknown identifiers are silently absent from the result; an empty
    /// input skips the network round trip entirely.
    pub async fn fetch_issues_by_identifiers(
        &self,
        identifiers: &[String],
    ) -> Result<Vec<RemoteIssue>, SyncError> {
        if identifiers.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/issues/lookup",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(&IssueLookupRequest { identifiers })
            .send()
            .await
            .map_err(|e| SyncError::tracker(format!("Issue lookup request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::tracker(format!(
                "Issue lookup failed ({}): {}",
                status, body
            )));
        }

        let payload: IssueLookupResponse = response
            .json()
            .await
            .map_err(|e| SyncError::tracker(format!("Malformed issue lookup response: {}", e)))?;
        Ok(payload.issues)
    }
}
