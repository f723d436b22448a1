//! GitHub API client.
//!
//! Typed wrapper over the forge's REST v3 endpoints plus the two GraphQL
//! mutations that have no REST equivalent (draft conversion). Returns wire
//! records; merging them into the cache model is the stores' job.

use chrono::{DateTime, Duration, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// GitHub API client configuration.
#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    /// Base URL of the API (e.g. `https://api.github.com`).
    pub base_url: String,

    /// Personal access token for authentication.
    pub token: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GitHubClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.github.com".to_string(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

/// GitHub API client.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    client: Client,
    config: GitHubClientConfig,
}

/// GitHub user from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteUser {
    pub login: String,
    pub avatar_url: Option<String>,
}

/// GitHub label from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLabel {
    pub name: String,
    #[serde(default)]
    pub color: String,
}

/// One side of a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: Option<String>,
}

/// GitHub pull request from API.
///
/// List responses omit the file-change totals (`additions` etc.), and the
/// closed-PR listing used for the merged path omits `requested_reviewers`;
/// those fields are `Option` so the store's merge can tell "not fetched"
/// from "empty".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePullRequest {
    pub number: i64,
    pub node_id: String,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub draft: bool,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user: RemoteUser,
    #[serde(default)]
    pub assignees: Vec<RemoteUser>,
    pub requested_reviewers: Option<Vec<RemoteUser>>,
    #[serde(default)]
    pub labels: Vec<RemoteLabel>,
    pub head: RemoteRef,
    pub base: RemoteRef,
    pub additions: Option<i64>,
    pub deletions: Option<i64>,
    pub changed_files: Option<i64>,
}

/// GitHub issue comment from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteComment {
    pub id: i64,
    pub user: RemoteUser,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// GitHub review from API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteReview {
    pub id: i64,
    pub user: RemoteUser,
    pub state: String,
    pub body: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Changed file in a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    pub filename: String,
    pub status: String,
    pub additions: i64,
    pub deletions: i64,
}

/// Commit on a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommit {
    pub sha: String,
    pub commit: RemoteCommitDetail,
}

/// Nested commit payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommitDetail {
    pub message: String,
}

/// Repository branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBranch {
    pub name: String,
    pub commit: RemoteBranchCommit,
}

/// Tip commit of a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBranchCommit {
    pub sha: String,
}

/// Query parameters for listing pull requests.
#[derive(Debug, Clone, Serialize)]
pub struct PullsQuery<'a> {
    pub state: &'a str,
    pub sort: &'a str,
    pub direction: &'a str,
    pub per_page: u32,
    pub page: u32,
}

/// Whether a closed PR was merged within the given day window.
pub fn merged_within(pr: &RemotePullRequest, days: i64, now: DateTime<Utc>) -> bool {
    match pr.merged_at {
        Some(merged_at) => now - merged_at <= Duration::days(days),
        None => false,
    }
}

impl GitHubClient {
    /// Create a new GitHub client.
    pub fn new(config: GitHubClientConfig) -> Result<Self, SyncError> {
        let mut headers = header::HeaderMap::new();

        let token_value = header::HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| SyncError::invalid_input("Invalid token format"))?;
        headers.insert(header::AUTHORIZATION, token_value);
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/vnd.github+json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .user_agent("forge-sync")
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Build a full URL for an API path.
    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Handle API response errors.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
        endpoint: &str,
    ) -> Result<T, SyncError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| SyncError::internal(format!("Failed to parse response: {}", e)));
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        let body_message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message")?.as_str().map(String::from));

        let message = match (status, &body_message) {
            (StatusCode::UNAUTHORIZED, _) => "Bad credentials".to_string(),
            (StatusCode::FORBIDDEN, Some(msg)) => msg.clone(),
            (StatusCode::FORBIDDEN, None) => "Access denied".to_string(),
            (StatusCode::NOT_FOUND, Some(msg)) => msg.clone(),
            (StatusCode::NOT_FOUND, None) => "Resource not found".to_string(),
            (StatusCode::TOO_MANY_REQUESTS, _) => "Rate limit exceeded".to_string(),
            (_, Some(msg)) => msg.clone(),
            _ => format!("Request failed ({}): {}", status_code, body),
        };

        Err(SyncError::api_full(message, status_code, endpoint))
    }

    /// Fetch all pages of a list endpoint.
    ///
    /// GitHub caps `per_page` at 100; a short page marks the end.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        extra_query: &[(&str, String)],
    ) -> Result<Vec<T>, SyncError> {
        const PER_PAGE: usize = 100;

        let mut all_data = Vec::new();
        let mut page = 1u32;

        loop {
            let url = self.api_url(endpoint);
            let response = self
                .client
                .get(&url)
                .query(extra_query)
                .query(&[
                    ("per_page", PER_PAGE.to_string()),
                    ("page", page.to_string()),
                ])
                .send()
                .await?;

            let data: Vec<T> = self.handle_response(response, endpoint).await?;
            let page_len = data.len();
            all_data.extend(data);

            if page_len < PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(all_data)
    }

    /// List pull requests for a repository by state (`open`, `closed`, `all`).
    pub async fn list_pull_requests(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<RemotePullRequest>, SyncError> {
        let endpoint = format!("/repos/{}/{}/pulls", owner, repo);
        self.get_all_pages(&endpoint, &[("state", state.to_string())])
            .await
    }

    /// List PRs merged within the last `days` days.
    ///
    /// The REST API has no merged-since filter, so this pages the closed
    /// listing in updated-descending order and filters by `merged_at`,
    /// stopping at the first page whose oldest entry fell out of the window.
    pub async fn list_recently_merged(
        &self,
        owner: &str,
        repo: &str,
        days: i64,
    ) -> Result<Vec<RemotePullRequest>, SyncError> {
        const PER_PAGE: usize = 100;

        let endpoint = format!("/repos/{}/{}/pulls", owner, repo);
        let now = Utc::now();
        let cutoff = now - Duration::days(days);

        let mut merged = Vec::new();
        let mut page = 1u32;

        loop {
            let url = self.api_url(&endpoint);
            let query = PullsQuery {
                state: "closed",
                sort: "updated",
                direction: "desc",
                per_page: PER_PAGE as u32,
                page,
            };
            let response = self.client.get(&url).query(&query).send().await?;
            let data: Vec<RemotePullRequest> = self.handle_response(response, &endpoint).await?;

            let page_len = data.len();
            let page_exhausted_window = data
                .last()
                .map(|pr| pr.updated_at < cutoff)
                .unwrap_or(true);

            merged.extend(data.into_iter().filter(|pr| merged_within(pr, days, now)));

            if page_len < PER_PAGE || page_exhausted_window {
                break;
            }
            page += 1;
        }

        Ok(merged)
    }

    /// Get a single pull request with file-change totals.
    pub async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<RemotePullRequest, SyncError> {
        let endpoint = format!("/repos/{}/{}/pulls/{}", owner, repo, number);
        let url = self.api_url(&endpoint);
        let response = self.client.get(&url).send().await?;
        self.handle_response(response, &endpoint).await
    }

    /// List changed files on a pull request.
    pub async fn list_files(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<RemoteFile>, SyncError> {
        let endpoint = format!("/repos/{}/{}/pulls/{}/files", owner, repo, number);
        self.get_all_pages(&endpoint, &[]).await
    }

    /// List commits on a pull request.
    pub async fn list_commits(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<RemoteCommit>, SyncError> {
        let endpoint = format!("/repos/{}/{}/pulls/{}/commits", owner, repo, number);
        self.get_all_pages(&endpoint, &[]).await
    }

    /// List issue comments on a pull request.
    pub async fn list_comments(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<RemoteComment>, SyncError> {
        let endpoint = format!("/repos/{}/{}/issues/{}/comments", owner, repo, number);
        self.get_all_pages(&endpoint, &[]).await
    }

    /// List reviews on a pull request.
    pub async fn list_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<RemoteReview>, SyncError> {
        let endpoint = format!("/repos/{}/{}/pulls/{}/reviews", owner, repo, number);
        self.get_all_pages(&endpoint, &[]).await
    }

    /// List members of an organization.
    pub async fn list_org_members(&self, org: &str) -> Result<Vec<RemoteUser>, SyncError> {
        let endpoint = format!("/orgs/{}/members", org);
        self.get_all_pages(&endpoint, &[]).await
    }

    /// List labels defined on a repository.
    pub async fn list_labels(&self, owner: &str, repo: &str) -> Result<Vec<RemoteLabel>, SyncError> {
        let endpoint = format!("/repos/{}/{}/labels", owner, repo);
        self.get_all_pages(&endpoint, &[]).await
    }

    /// List branches of a repository.
    pub async fn list_branches(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<RemoteBranch>, SyncError> {
        let endpoint = format!("/repos/{}/{}/branches", owner, repo);
        self.get_all_pages(&endpoint, &[]).await
    }

    /// Add labels to a pull request. Returns the full resulting label set.
    pub async fn add_labels(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        labels: &[String],
    ) -> Result<Vec<RemoteLabel>, SyncError> {
        let endpoint = format!("/repos/{}/{}/issues/{}/labels", owner, repo, number);
        let url = self.api_url(&endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "labels": labels }))
            .send()
            .await?;
        self.handle_response(response, &endpoint).await
    }

    /// Remove a label from a pull request.
    pub async fn remove_label(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        label: &str,
    ) -> Result<(), SyncError> {
        // Label names may contain spaces and unicode.
        let encoded = urlencoding::encode(label);
        let endpoint = format!("/repos/{}/{}/issues/{}/labels/{}", owner, repo, number, encoded);
        let url = self.api_url(&endpoint);
        let response = self.client.delete(&url).send().await?;

        if response.status().is_success() {
            return Ok(());
        }
        // Removing an absent label is an expected constraint, not a failure.
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::constraint(format!(
                "Label does not exist: {}",
                label
            )));
        }
        Err(SyncError::api_full(
            "Failed to remove label",
            response.status().as_u16(),
            &endpoint,
        ))
    }

    /// Request reviews from the given users.
    pub async fn request_reviewers(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        reviewers: &[String],
    ) -> Result<RemotePullRequest, SyncError> {
        let endpoint = format!(
            "/repos/{}/{}/pulls/{}/requested_reviewers",
            owner, repo, number
        );
        let url = self.api_url(&endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "reviewers": reviewers }))
            .send()
            .await?;
        self.handle_response(response, &endpoint).await
    }

    /// Post a comment on a pull request. Returns the server echo.
    pub async fn create_comment(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        body: &str,
    ) -> Result<RemoteComment, SyncError> {
        let endpoint = format!("/repos/{}/{}/issues/{}/comments", owner, repo, number);
        let url = self.api_url(&endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        self.handle_response(response, &endpoint).await
    }

    /// Submit a review (`APPROVE`, `REQUEST_CHANGES`, or `COMMENT`).
    pub async fn create_review(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        event: &str,
        body: &str,
    ) -> Result<RemoteReview, SyncError> {
        let endpoint = format!("/repos/{}/{}/pulls/{}/reviews", owner, repo, number);
        let url = self.api_url(&endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "event": event, "body": body }))
            .send()
            .await?;
        self.handle_response(response, &endpoint).await
    }

    /// Merge a pull request.
    pub async fn merge_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<(), SyncError> {
        let endpoint = format!("/repos/{}/{}/pulls/{}/merge", owner, repo, number);
        let url = self.api_url(&endpoint);
        let response = self.client.put(&url).send().await?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message")?.as_str().map(String::from))
            .unwrap_or_else(|| match status.as_u16() {
                405 => "Pull request is not mergeable".into(),
                409 => "Head branch was modified".into(),
                _ => format!("Merge failed ({})", status),
            });

        Err(SyncError::api_full(message, status.as_u16(), &endpoint))
    }

    /// Update mutable PR fields (title, body). Returns the server echo.
    pub async fn update_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        fields: &serde_json::Value,
    ) -> Result<RemotePullRequest, SyncError> {
        let endpoint = format!("/repos/{}/{}/pulls/{}", owner, repo, number);
        let url = self.api_url(&endpoint);
        let response = self.client.patch(&url).json(fields).send().await?;
        self.handle_response(response, &endpoint).await
    }

    /// Set a PR's draft flag via GraphQL.
    ///
    /// There is no single idempotent REST toggle; the caller selects the
    /// direction and this issues `convertPullRequestToDraft` or
    /// `markPullRequestReadyForReview`. Returns the resulting draft flag.
    pub async fn set_draft(&self, node_id: &str, draft: bool) -> Result<bool, SyncError> {
        let (mutation, field) = if draft {
            ("convertPullRequestToDraft", "convertPullRequestToDraft")
        } else {
            ("markPullRequestReadyForReview", "markPullRequestReadyForReview")
        };

        let query = format!(
            "mutation($id: ID!) {{ {}(input: {{pullRequestId: $id}}) {{ pullRequest {{ isDraft }} }} }}",
            mutation
        );
        let body = serde_json::json!({
            "query": query,
            "variables": { "id": node_id },
        });

        let url = self.api_url("/graphql");
        let response = self.client.post(&url).json(&body).send().await?;
        let payload: serde_json::Value = self.handle_response(response, "/graphql").await?;

        if let Some(errors) = payload.get("errors").and_then(|e| e.as_array()) {
            if let Some(first) = errors.first() {
                let message = first
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("GraphQL mutation failed");
                return Err(SyncError::api_full(message, 200, "/graphql"));
            }
        }

        payload
            .get("data")
            .and_then(|d| d.get(field))
            .and_then(|m| m.get("pullRequest"))
            .and_then(|p| p.get("isDraft"))
            .and_then(|v| v.as_bool())
            .ok_or_else(|| SyncError::internal("Malformed GraphQL draft response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_pr(number: i64, merged_at: Option<&str>, updated_at: &str) -> RemotePullRequest {
        RemotePullRequest {
            number,
            node_id: format!("PR_node{}", number),
            title: format!("PR {}", number),
            body: None,
            state: "closed".to_string(),
            draft: false,
            merged_at: merged_at.map(|s| s.parse().unwrap()),
            closed_at: None,
            created_at: "2024-01-01T00:00:00Z".parse().unwrap(),
            updated_at: updated_at.parse().unwrap(),
            user: RemoteUser {
                login: "author".to_string(),
                avatar_url: None,
            },
            assignees: Vec::new(),
            requested_reviewers: None,
            labels: Vec::new(),
            head: RemoteRef {
                ref_name: "feature".to_string(),
                sha: None,
            },
            base: RemoteRef {
                ref_name: "main".to_string(),
                sha: None,
            },
            additions: None,
            deletions: None,
            changed_files: None,
        }
    }

    #[test]
    fn test_api_url_construction() {
        let client = GitHubClient::new(GitHubClientConfig {
            base_url: "https://api.github.com/".to_string(),
            token: "test-token".to_string(),
            timeout_secs: 30,
        })
        .unwrap();

        assert_eq!(
            client.api_url("/repos/acme/widgets/pulls"),
            "https://api.github.com/repos/acme/widgets/pulls"
        );
    }

    #[test]
    fn test_pulls_query_serialization() {
        let query = PullsQuery {
            state: "closed",
            sort: "updated",
            direction: "desc",
            per_page: 100,
            page: 2,
        };
        let json = serde_json::to_string(&query).unwrap();
        assert!(json.contains("\"state\":\"closed\""));
        assert!(json.contains("\"direction\":\"desc\""));
        assert!(json.contains("\"page\":2"));
    }

    #[test]
    fn test_merged_within_window() {
        let now: DateTime<Utc> = "2024-03-10T00:00:00Z".parse().unwrap();

        let recent = remote_pr(1, Some("2024-03-08T12:00:00Z"), "2024-03-08T12:00:00Z");
        assert!(merged_within(&recent, 7, now));

        let old = remote_pr(2, Some("2024-02-01T00:00:00Z"), "2024-02-01T00:00:00Z");
        assert!(!merged_within(&old, 7, now));

        // Closed without merging never counts.
        let unmerged = remote_pr(3, None, "2024-03-09T00:00:00Z");
        assert!(!merged_within(&unmerged, 7, now));
    }

    #[test]
    fn test_pull_request_deserializes_without_optional_fields() {
        // Shape of a list-endpoint item: no additions/changed_files and no
        // requested_reviewers.
        let json = serde_json::json!({
            "number": 7,
            "node_id": "PR_abc",
            "title": "Fix login",
            "body": null,
            "state": "open",
            "merged_at": null,
            "closed_at": null,
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "2024-03-02T10:00:00Z",
            "user": { "login": "alice", "avatar_url": null },
            "head": { "ref": "fix-login", "sha": "abc123" },
            "base": { "ref": "main", "sha": "def456" },
        });

        let pr: RemotePullRequest = serde_json::from_value(json).unwrap();
        assert_eq!(pr.number, 7);
        assert!(pr.requested_reviewers.is_none());
        assert!(pr.additions.is_none());
        assert!(!pr.draft);
    }
}
