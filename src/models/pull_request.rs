//! Pull request model and patch type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::key::PrKey;

/// State of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
}

impl From<&str> for PrState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "closed" => Self::Closed,
            _ => Self::Open,
        }
    }
}

impl std::fmt::Display for PrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Summary approval status derived from the set of submitted reviews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    ChangesRequested,
    Pending,
    None,
}

impl From<&str> for ApprovalStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "approved" => Self::Approved,
            "changes_requested" => Self::ChangesRequested,
            "pending" => Self::Pending,
            _ => Self::None,
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::ChangesRequested => write!(f, "changes_requested"),
            Self::Pending => write!(f, "pending"),
            Self::None => write!(f, "none"),
        }
    }
}

/// A forge user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl User {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            avatar_url: None,
        }
    }
}

/// A repository label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    #[serde(default)]
    pub color: String,
}

/// A branch reference on one side of a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    /// Branch name.
    #[serde(rename = "ref")]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
}

/// A file changed by a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    /// Change kind as reported by the forge (`added`, `modified`, ...).
    pub status: String,
    pub additions: i64,
    pub deletions: i64,
}

/// A commit on a pull request branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
}

/// A pull request as held in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub key: PrKey,

    /// GraphQL node id, needed for the draft-toggle mutations.
    pub node_id: String,

    pub title: String,
    pub body: String,
    pub state: PrState,
    pub draft: bool,
    pub merged: bool,

    pub head: BranchRef,
    pub base: BranchRef,

    pub author: User,
    pub assignees: Vec<User>,
    pub requested_reviewers: Vec<User>,
    pub labels: Vec<Label>,

    /// Derived from the latest review per reviewer; `None` until reviews for
    /// this PR have been fetched.
    pub approval_status: ApprovalStatus,
    pub approved_by: Vec<String>,
    pub changes_requested_by: Vec<String>,

    pub additions: i64,
    pub deletions: i64,
    pub changed_files: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
}

impl PullRequest {
    /// Re-establish the `merged ⇒ closed` invariant after any write.
    pub fn normalize(&mut self) {
        if self.merged {
            self.state = PrState::Closed;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PrState::Open
    }
}

/// Partial update for a pull request.
///
/// Every field is optional; [`PullRequest::apply`] performs a shallow merge so
/// a patch can never clear a field it does not name.
#[derive(Debug, Clone, Default)]
pub struct PullRequestPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub state: Option<PrState>,
    pub draft: Option<bool>,
    pub merged: Option<bool>,
    pub assignees: Option<Vec<User>>,
    pub requested_reviewers: Option<Vec<User>>,
    pub labels: Option<Vec<Label>>,
    pub approval_status: Option<ApprovalStatus>,
    pub approved_by: Option<Vec<String>>,
    pub changes_requested_by: Option<Vec<String>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<Option<DateTime<Utc>>>,
    pub merged_at: Option<Option<DateTime<Utc>>>,
}

impl PullRequest {
    /// Apply a shallow patch, then normalize.
    pub fn apply(&mut self, patch: PullRequestPatch) {
        if let Some(v) = patch.title {
            self.title = v;
        }
        if let Some(v) = patch.body {
            self.body = v;
        }
        if let Some(v) = patch.state {
            self.state = v;
        }
        if let Some(v) = patch.draft {
            self.draft = v;
        }
        if let Some(v) = patch.merged {
            self.merged = v;
        }
        if let Some(v) = patch.assignees {
            self.assignees = v;
        }
        if let Some(v) = patch.requested_reviewers {
            self.requested_reviewers = v;
        }
        if let Some(v) = patch.labels {
            self.labels = v;
        }
        if let Some(v) = patch.approval_status {
            self.approval_status = v;
        }
        if let Some(v) = patch.approved_by {
            self.approved_by = v;
        }
        if let Some(v) = patch.changes_requested_by {
            self.changes_requested_by = v;
        }
        if let Some(v) = patch.updated_at {
            self.updated_at = v;
        }
        if let Some(v) = patch.closed_at {
            self.closed_at = v;
        }
        if let Some(v) = patch.merged_at {
            self.merged_at = v;
        }
        self.normalize();
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::pr;
    use super::*;

    #[test]
    fn test_state_from_str() {
        assert_eq!(PrState::from("open"), PrState::Open);
        assert_eq!(PrState::from("CLOSED"), PrState::Closed);
        assert_eq!(PrState::from("unknown"), PrState::Open);
    }

    #[test]
    fn test_approval_status_from_str() {
        assert_eq!(ApprovalStatus::from("approved"), ApprovalStatus::Approved);
        assert_eq!(
            ApprovalStatus::from("changes_requested"),
            ApprovalStatus::ChangesRequested
        );
        assert_eq!(ApprovalStatus::from("none"), ApprovalStatus::None);
        assert_eq!(ApprovalStatus::from(""), ApprovalStatus::None);
    }

    #[test]
    fn test_merged_implies_closed() {
        let mut pr = pr("acme", "widgets", 1);
        pr.apply(PullRequestPatch {
            merged: Some(true),
            merged_at: Some(Some("2024-03-02T10:00:00Z".parse().unwrap())),
            ..Default::default()
        });
        assert_eq!(pr.state, PrState::Closed);
        assert!(pr.merged);
    }

    #[test]
    fn test_patch_does_not_clear_unnamed_fields() {
        let mut pr = pr("acme", "widgets", 1);
        pr.requested_reviewers = vec![User::new("reviewer")];
        pr.apply(PullRequestPatch {
            title: Some("New title".to_string()),
            ..Default::default()
        });
        assert_eq!(pr.title, "New title");
        assert_eq!(pr.requested_reviewers.len(), 1);
    }
}
