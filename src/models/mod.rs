//! Data models for the synchronization layer.
//!
//! These are the canonical in-memory records the cache stores hold and the
//! UI renders. Wire records from the forge and tracker APIs live with their
//! clients; converting them into these types is the merge step.

pub mod activity;
pub mod key;
pub mod pull_request;
pub mod review;
pub mod tracker;

// Re-exports for convenient access
pub use activity::{Activity, ActivityKind};
pub use key::{PrKey, RepoKey};
pub use pull_request::{
    ApprovalStatus, BranchRef, ChangedFile, CommitInfo, Label, PrState, PullRequest,
    PullRequestPatch, User,
};
pub use review::{summarize_reviews, ApprovalSummary, Comment, Review, ReviewState};
pub use tracker::{ExternalIssue, LinkedPr};
