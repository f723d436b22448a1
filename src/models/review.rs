//! Comment and review models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::pull_request::{ApprovalStatus, User};

/// State of a submitted review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Pending,
    Commented,
    Approved,
    ChangesRequested,
    Dismissed,
}

impl From<&str> for ReviewState {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "APPROVED" => Self::Approved,
            "CHANGES_REQUESTED" => Self::ChangesRequested,
            "COMMENTED" => Self::Commented,
            "DISMISSED" => Self::Dismissed,
            _ => Self::Pending,
        }
    }
}

/// A comment on a pull request.
///
/// Optimistically posted comments carry a `local-<uuid>` id until the server
/// echo replaces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: User,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    /// Create an optimistic local comment with a placeholder id.
    pub fn local(author: User, body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            author,
            body: body.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this comment is still awaiting its server echo.
    pub fn is_local(&self) -> bool {
        self.id.starts_with("local-")
    }
}

/// A review on a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub author: User,
    pub state: ReviewState,
    pub body: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl Review {
    /// Create an optimistic local review with a placeholder id.
    pub fn local(author: User, state: ReviewState, body: impl Into<String>) -> Self {
        Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            author,
            state,
            body: body.into(),
            submitted_at: Some(Utc::now()),
        }
    }
}

/// Summary of a PR's review state: the overall status plus the reviewer sets
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalSummary {
    pub status: ApprovalStatus,
    pub approved_by: Vec<String>,
    pub changes_requested_by: Vec<String>,
}

/// Derive the approval summary from a review list.
///
/// Only the latest non-dismissed review per reviewer counts. Any outstanding
/// changes-request wins over approvals; approvals win over pending.
pub fn summarize_reviews(reviews: &[Review]) -> ApprovalSummary {
    use std::collections::HashMap;

    // Latest review per reviewer, in submission order.
    let mut latest: HashMap<&str, ReviewState> = HashMap::new();
    for review in reviews {
        match review.state {
            // A dismissed review voids the reviewer's previous verdict.
            ReviewState::Dismissed => {
                latest.remove(review.author.login.as_str());
            }
            // Plain comments don't change a standing verdict.
            ReviewState::Commented => {
                latest
                    .entry(review.author.login.as_str())
                    .or_insert(ReviewState::Commented);
            }
            state => {
                latest.insert(review.author.login.as_str(), state);
            }
        }
    }

    let mut approved_by: Vec<String> = latest
        .iter()
        .filter(|(_, s)| **s == ReviewState::Approved)
        .map(|(login, _)| login.to_string())
        .collect();
    let mut changes_requested_by: Vec<String> = latest
        .iter()
        .filter(|(_, s)| **s == ReviewState::ChangesRequested)
        .map(|(login, _)| login.to_string())
        .collect();
    approved_by.sort();
    changes_requested_by.sort();

    let status = if !changes_requested_by.is_empty() {
        ApprovalStatus::ChangesRequested
    } else if !approved_by.is_empty() {
        ApprovalStatus::Approved
    } else if latest.values().any(|s| *s == ReviewState::Pending) {
        ApprovalStatus::Pending
    } else {
        ApprovalStatus::None
    };

    ApprovalSummary {
        status,
        approved_by,
        changes_requested_by,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(login: &str, state: ReviewState) -> Review {
        Review {
            id: format!("r-{}", login),
            author: User::new(login),
            state,
            body: String::new(),
            submitted_at: Some("2024-03-01T10:00:00Z".parse().unwrap()),
        }
    }

    #[test]
    fn test_no_reviews_means_none() {
        let summary = summarize_reviews(&[]);
        assert_eq!(summary.status, ApprovalStatus::None);
        assert!(summary.approved_by.is_empty());
    }

    #[test]
    fn test_approval() {
        let summary = summarize_reviews(&[review("alice", ReviewState::Approved)]);
        assert_eq!(summary.status, ApprovalStatus::Approved);
        assert_eq!(summary.approved_by, vec!["alice"]);
    }

    #[test]
    fn test_changes_requested_wins_over_approval() {
        let summary = summarize_reviews(&[
            review("alice", ReviewState::Approved),
            review("bob", ReviewState::ChangesRequested),
        ]);
        assert_eq!(summary.status, ApprovalStatus::ChangesRequested);
        assert_eq!(summary.approved_by, vec!["alice"]);
        assert_eq!(summary.changes_requested_by, vec!["bob"]);
    }

    #[test]
    fn test_latest_review_per_reviewer_counts() {
        let summary = summarize_reviews(&[
            review("alice", ReviewState::ChangesRequested),
            review("alice", ReviewState::Approved),
        ]);
        assert_eq!(summary.status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_dismissal_voids_verdict() {
        let summary = summarize_reviews(&[
            review("alice", ReviewState::ChangesRequested),
            review("alice", ReviewState::Dismissed),
        ]);
        assert_eq!(summary.status, ApprovalStatus::None);
    }

    #[test]
    fn test_comment_does_not_override_verdict() {
        let summary = summarize_reviews(&[
            review("alice", ReviewState::Approved),
            review("alice", ReviewState::Commented),
        ]);
        assert_eq!(summary.status, ApprovalStatus::Approved);
    }

    #[test]
    fn test_local_comment_placeholder() {
        let comment = Comment::local(User::new("me"), "looks good");
        assert!(comment.is_local());
    }
}
