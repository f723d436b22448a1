//! Repository metadata stores: org members, labels, branches.
//!
//! Thin wrappers over the fetch coordinator. Members change rarely, so their
//! window is a full hour; labels and branches refresh more often.

use std::time::Duration;

use crate::error::SyncError;
use crate::models::{BranchRef, Label, RepoKey, User};
use crate::services::cache::FetchCache;

const MEMBERS_FRESHNESS: Duration = Duration::from_secs(3600);
const LABELS_FRESHNESS: Duration = Duration::from_secs(600);
const BRANCHES_FRESHNESS: Duration = Duration::from_secs(600);

/// Cached per-org and per-repo metadata.
pub struct RepoMetaStore {
    members: FetchCache<Vec<User>>,
    labels: FetchCache<Vec<Label>>,
    branches: FetchCache<Vec<BranchRef>>,
}

impl Default for RepoMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RepoMetaStore {
    pub fn new() -> Self {
        Self {
            members: FetchCache::new(MEMBERS_FRESHNESS),
            labels: FetchCache::new(LABELS_FRESHNESS),
            branches: FetchCache::new(BRANCHES_FRESHNESS),
        }
    }

    pub fn members(&self) -> &FetchCache<Vec<User>> {
        &self.members
    }

    pub fn labels(&self) -> &FetchCache<Vec<Label>> {
        &self.labels
    }

    pub fn branches(&self) -> &FetchCache<Vec<BranchRef>> {
        &self.branches
    }

    /// Fetch an organization's member list.
    pub async fn fetch_members<F, Fut>(
        &self,
        org: &str,
        force: bool,
        fetch: F,
    ) -> Result<Vec<User>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<User>, SyncError>>,
    {
        self.members.get_or_fetch(org, force, fetch).await
    }

    /// Fetch a repository's label definitions.
    pub async fn fetch_labels<F, Fut>(
        &self,
        repo: &RepoKey,
        force: bool,
        fetch: F,
    ) -> Result<Vec<Label>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<Label>, SyncError>>,
    {
        self.labels.get_or_fetch(&repo.to_string(), force, fetch).await
    }

    /// Fetch a repository's branches.
    pub async fn fetch_branches<F, Fut>(
        &self,
        repo: &RepoKey,
        force: bool,
        fetch: F,
    ) -> Result<Vec<BranchRef>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<BranchRef>, SyncError>>,
    {
        self.branches.get_or_fetch(&repo.to_string(), force, fetch).await
    }

    /// Drop everything. Used at logout.
    pub async fn clear(&self) {
        self.members.clear().await;
        self.labels.clear().await;
        self.branches.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_members_fresh_window_reuses_cache() {
        let store = RepoMetaStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![User::new("alice")])
        };

        store
            .fetch_members("acme", false, || fetch(calls.clone()))
            .await
            .unwrap();
        let cached = store
            .fetch_members("acme", false, || fetch(calls.clone()))
            .await
            .unwrap();

        assert_eq!(cached[0].login, "alice");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_labels_keyed_per_repo() {
        let store = RepoMetaStore::new();

        store
            .fetch_labels(&RepoKey::new("acme", "widgets"), false, || async {
                Ok(vec![Label {
                    name: "bug".to_string(),
                    color: "d73a4a".to_string(),
                }])
            })
            .await
            .unwrap();

        let other = store
            .fetch_labels(&RepoKey::new("acme", "gadgets"), false, || async {
                Ok(Vec::new())
            })
            .await
            .unwrap();

        assert!(other.is_empty());
        assert_eq!(
            store.labels().get("acme/widgets").await.unwrap()[0].name,
            "bug"
        );
    }

    #[tokio::test]
    async fn test_clear_empties_all_stores() {
        let store = RepoMetaStore::new();
        store
            .fetch_members("acme", false, || async { Ok(vec![User::new("alice")]) })
            .await
            .unwrap();

        store.clear().await;
        assert!(store.members().get("acme").await.is_none());
    }
}
