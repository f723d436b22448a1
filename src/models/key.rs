//! Cache keys for repository- and PR-scoped entries.

use serde::{Deserialize, Serialize};

/// Identifies a repository: renders as `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoKey {
    pub owner: String,
    pub repo: String,
}

impl RepoKey {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    /// Key for a PR within this repository.
    pub fn pr(&self, number: i64) -> PrKey {
        PrKey {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            number,
        }
    }
}

impl std::fmt::Display for RepoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Identifies a pull request: renders as `owner/repo#number`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrKey {
    pub owner: String,
    pub repo: String,
    pub number: i64,
}

impl PrKey {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, number: i64) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            number,
        }
    }

    pub fn repo_key(&self) -> RepoKey {
        RepoKey {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
        }
    }
}

impl std::fmt::Display for PrKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_key_display() {
        assert_eq!(RepoKey::new("acme", "widgets").to_string(), "acme/widgets");
    }

    #[test]
    fn test_pr_key_display() {
        assert_eq!(
            RepoKey::new("acme", "widgets").pr(7).to_string(),
            "acme/widgets#7"
        );
    }

    #[test]
    fn test_pr_key_repo_key() {
        let key = PrKey::new("acme", "widgets", 7);
        assert_eq!(key.repo_key(), RepoKey::new("acme", "widgets"));
    }
}
