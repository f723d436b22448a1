//! External issue tracker models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::pull_request::{ApprovalStatus, PrState, PullRequest};

/// An issue in the external tracker, cross-referenced from PR text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalIssue {
    /// Uppercased short code (e.g. `ENG-42`) or numeric id.
    pub identifier: String,
    pub title: String,
    pub status: String,
    /// Severity/level as reported by the tracker (e.g. `error`, `warning`).
    pub level: Option<String>,
    /// Projection of PRs referencing this issue. Recomputed on every relink,
    /// never an independent relationship.
    pub linked_prs: Vec<LinkedPr>,
}

/// The subset of PR fields a link card needs, so external consumers never
/// hold a full (and therefore stale-able) PR record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedPr {
    pub number: i64,
    pub title: String,
    pub state: PrState,
    pub draft: bool,
    pub merged: bool,
    pub approval_status: ApprovalStatus,
    pub author: String,
    pub updated_at: DateTime<Utc>,
}

impl LinkedPr {
    /// Project the link-card fields out of a cached PR.
    pub fn from_pr(pr: &PullRequest) -> Self {
        Self {
            number: pr.key.number,
            title: pr.title.clone(),
            state: pr.state,
            draft: pr.draft,
            merged: pr.merged,
            approval_status: pr.approval_status,
            author: pr.author.login.clone(),
            updated_at: pr.updated_at,
        }
    }
}
