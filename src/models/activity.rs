//! Derived activity feed events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::key::PrKey;
use crate::models::review::ReviewState;

/// Kind of feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Opened,
    Merged,
    Closed,
    Review,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::Merged => write!(f, "merged"),
            Self::Closed => write!(f, "closed"),
            Self::Review => write!(f, "review"),
        }
    }
}

/// A single feed event, replayed from the PR cache.
///
/// Never persisted; regenerated on every relevant cache revision bump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub kind: ActivityKind,
    pub timestamp: DateTime<Utc>,
    pub pr: PrKey,
    pub title: String,
    /// Reviewer login for review events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Review verdict for review events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_state: Option<ReviewState>,
}
