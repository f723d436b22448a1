//! Pull request cache store.
//!
//! One shared map of `PrKey -> PullRequest` fed by two fetch strategies (open
//! listing and recently-merged listing) plus per-PR sub-collection caches for
//! files, commits, comments, and reviews.
//!
//! The two list strategies fetch different field sets, so applying results is
//! a merge, never a replacement: fields a strategy did not fetch keep their
//! cached values. Records are only ever replaced by newer data, not deleted.
//!
//! Optimistic mutations race with in-flight fetches. Every local mutation
//! stamps its key with a sequence number; a fetch snapshots the sequence when
//! it is issued and, when applying results, skips any key mutated after the
//! snapshot so a slow response cannot overwrite a newer local write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};

use crate::error::SyncError;
use crate::models::{
    summarize_reviews, BranchRef, ChangedFile, Comment, CommitInfo, Label, PrKey, PrState,
    PullRequest, PullRequestPatch, RepoKey, Review, User,
};
use crate::services::cache::{FetchCache, InFlightGuard, InFlightMap};
use crate::services::github_client::{RemotePullRequest, RemoteRef, RemoteUser};

/// Freshness window for the PR listings.
const LIST_FRESHNESS: Duration = Duration::from_secs(60);

/// Freshness window for per-PR sub-collections.
const DETAIL_FRESHNESS: Duration = Duration::from_secs(120);

/// Shared pull request cache.
pub struct PullRequestStore {
    prs: RwLock<HashMap<PrKey, PullRequest>>,

    /// Completion time per list-fetch key (`open:owner/repo` etc.).
    list_fetched_at: Mutex<HashMap<String, Instant>>,
    /// Repository of the most recently completed list fetch.
    last_fetched_repo: Mutex<Option<RepoKey>>,
    in_flight: InFlightMap,
    freshness: Duration,

    revision: AtomicU64,
    changes: broadcast::Sender<u64>,

    /// Monotone counter of local mutations, and the last value stamped per key.
    mutation_seq: AtomicU64,
    key_mutated_at: RwLock<HashMap<PrKey, u64>>,

    files: FetchCache<Vec<ChangedFile>>,
    commits: FetchCache<Vec<CommitInfo>>,
    comments: FetchCache<Vec<Comment>>,
    reviews: FetchCache<Vec<Review>>,
}

impl Default for PullRequestStore {
    fn default() -> Self {
        Self::new(LIST_FRESHNESS)
    }
}

impl PullRequestStore {
    pub fn new(freshness: Duration) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            prs: RwLock::new(HashMap::new()),
            list_fetched_at: Mutex::new(HashMap::new()),
            last_fetched_repo: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            freshness,
            revision: AtomicU64::new(0),
            changes,
            mutation_seq: AtomicU64::new(0),
            key_mutated_at: RwLock::new(HashMap::new()),
            files: FetchCache::new(DETAIL_FRESHNESS),
            commits: FetchCache::new(DETAIL_FRESHNESS),
            comments: FetchCache::new(DETAIL_FRESHNESS),
            reviews: FetchCache::new(DETAIL_FRESHNESS),
        }
    }

    /// Current revision. Bumped on every applied fetch or local mutation.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Subscribe to revision changes.
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump_revision(&self) {
        let rev = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.changes.send(rev);
    }

    /// Read one cached PR.
    pub async fn get(&self, key: &PrKey) -> Option<PullRequest> {
        self.prs.read().await.get(key).cloned()
    }

    /// All cached PRs for a repository, newest activity first.
    pub async fn all_for_repo(&self, repo: &RepoKey) -> Vec<PullRequest> {
        let prs = self.prs.read().await;
        let mut result: Vec<PullRequest> = prs
            .values()
            .filter(|pr| pr.key.owner == repo.owner && pr.key.repo == repo.repo)
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.key.number.cmp(&a.key.number))
        });
        result
    }

    /// Snapshot of the whole map, for projections.
    pub async fn snapshot(&self) -> HashMap<PrKey, PullRequest> {
        self.prs.read().await.clone()
    }

    /// Whether a list fetch for this repo strategy is in flight.
    pub async fn is_loading(&self, repo: &RepoKey) -> bool {
        let in_flight = self.in_flight.lock().unwrap();
        in_flight.contains_key(&format!("open:{}", repo))
            || in_flight.contains_key(&format!("merged:{}", repo))
    }

    /// Repository of the most recently completed list fetch, if any.
    pub fn last_fetched_repo(&self) -> Option<RepoKey> {
        self.last_fetched_repo.lock().unwrap().clone()
    }

    pub fn files(&self) -> &FetchCache<Vec<ChangedFile>> {
        &self.files
    }

    pub fn commits(&self) -> &FetchCache<Vec<CommitInfo>> {
        &self.commits
    }

    pub fn comments(&self) -> &FetchCache<Vec<Comment>> {
        &self.comments
    }

    pub fn reviews(&self) -> &FetchCache<Vec<Review>> {
        &self.reviews
    }

    /// Apply a local mutation, stamping the key's mutation sequence.
    ///
    /// This is the single entry point for optimistic writes; fetch results
    /// issued before this call will skip the key instead of overwriting it.
    ///
    /// The stamp lands in the same critical section as the patch, with the
    /// locks taken in the same order as `apply_remote_batch`; a batch apply
    /// therefore sees either neither the patch nor the stamp, or both.
    pub async fn update_pr(
        &self,
        key: &PrKey,
        patch: PullRequestPatch,
    ) -> Result<PullRequest, SyncError> {
        let updated = {
            let mut key_mutated_at = self.key_mutated_at.write().await;
            let mut prs = self.prs.write().await;
            let pr = prs
                .get_mut(key)
                .ok_or_else(|| SyncError::not_found_with_id("pull request", key.to_string()))?;
            pr.apply(patch);
            let seq = self.mutation_seq.fetch_add(1, Ordering::SeqCst) + 1;
            key_mutated_at.insert(key.clone(), seq);
            pr.clone()
        };

        self.bump_revision();
        Ok(updated)
    }

    /// Fetch the open PRs of a repository (fast path) and merge them in.
    ///
    /// Returns the open PRs cached for the repo after the merge.
    pub async fn fetch_open<F, Fut>(
        &self,
        repo: &RepoKey,
        force: bool,
        fetch: F,
    ) -> Result<Vec<PullRequest>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<RemotePullRequest>, SyncError>>,
    {
        let list_key = format!("open:{}", repo);
        self.run_list_fetch(&list_key, repo, force, fetch).await?;
        Ok(self
            .all_for_repo(repo)
            .await
            .into_iter()
            .filter(|pr| pr.is_open())
            .collect())
    }

    /// Fetch recently merged PRs and merge them in.
    ///
    /// The closure is expected to return only PRs merged within the caller's
    /// day window. Returns the merged PRs cached for the repo afterwards.
    pub async fn fetch_recently_merged<F, Fut>(
        &self,
        repo: &RepoKey,
        force: bool,
        fetch: F,
    ) -> Result<Vec<PullRequest>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<RemotePullRequest>, SyncError>>,
    {
        let list_key = format!("merged:{}", repo);
        self.run_list_fetch(&list_key, repo, force, fetch).await?;

        let mut merged: Vec<PullRequest> = self
            .all_for_repo(repo)
            .await
            .into_iter()
            .filter(|pr| pr.merged)
            .collect();
        merged.sort_by(|a, b| b.merged_at.cmp(&a.merged_at));
        Ok(merged)
    }

    fn list_is_fresh(&self, list_key: &str) -> bool {
        self.list_fetched_at
            .lock()
            .unwrap()
            .get(list_key)
            .map(|at| at.elapsed() < self.freshness)
            .unwrap_or(false)
    }

    /// Shared list-fetch driver: freshness check, in-flight coordination,
    /// stale-write-guarded merge.
    async fn run_list_fetch<F, Fut>(
        &self,
        list_key: &str,
        repo: &RepoKey,
        force: bool,
        fetch: F,
    ) -> Result<(), SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<RemotePullRequest>, SyncError>>,
    {
        if !force && self.list_is_fresh(list_key) {
            return Ok(());
        }

        let mut rx = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(list_key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    if !force && self.list_is_fresh(list_key) {
                        return Ok(());
                    }
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(list_key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            return match rx.recv().await {
                Ok(outcome) => outcome,
                Err(_) => Err(SyncError::internal(format!(
                    "in-flight fetch for {} was dropped",
                    list_key
                ))),
            };
        }

        // This caller owns the fetch. The guard releases the list key even if
        // this future is dropped mid-fetch. Snapshot the mutation sequence
        // before issuing the request: keys mutated after this point must not
        // be overwritten by the response.
        let guard = InFlightGuard::new(&self.in_flight, list_key);
        let seq_snapshot = self.mutation_seq.load(Ordering::SeqCst);
        let result = fetch().await;

        let outcome = match result {
            Ok(remotes) => {
                self.apply_remote_batch(repo, remotes, seq_snapshot).await;
                self.list_fetched_at
                    .lock()
                    .unwrap()
                    .insert(list_key.to_string(), Instant::now());
                *self.last_fetched_repo.lock().unwrap() = Some(repo.clone());
                self.bump_revision();
                Ok(())
            }
            Err(e) => {
                log::error!("PR list fetch failed for {}: {}", list_key, e);
                Err(e)
            }
        };

        guard.complete(outcome.clone());
        outcome
    }

    async fn apply_remote_batch(
        &self,
        repo: &RepoKey,
        remotes: Vec<RemotePullRequest>,
        seq_snapshot: u64,
    ) {
        let key_mutated_at = self.key_mutated_at.read().await;
        let mut prs = self.prs.write().await;

        for remote in remotes {
            let key = repo.pr(remote.number);

            if let Some(existing) = prs.get(&key) {
                let mutated_since = key_mutated_at
                    .get(&key)
                    .map(|seq| *seq > seq_snapshot)
                    .unwrap_or(false);
                if mutated_since {
                    log::warn!("skipping stale fetch result for {}", key);
                    continue;
                }
                let merged = merge_remote(existing, &remote);
                prs.insert(key, merged);
            } else {
                prs.insert(key.clone(), from_remote(key, &remote));
            }
        }
    }

    /// Fetch a PR's reviews and re-derive its approval status.
    pub async fn fetch_reviews<F, Fut>(
        &self,
        key: &PrKey,
        force: bool,
        fetch: F,
    ) -> Result<Vec<Review>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<Review>, SyncError>>,
    {
        let before = self.reviews.revision();
        let reviews = self.reviews.get_or_fetch(&key.to_string(), force, fetch).await?;

        // Only re-derive when a fetch actually landed; a fresh cache hit
        // changes nothing.
        if self.reviews.revision() != before {
            let summary = summarize_reviews(&reviews);
            let patch = PullRequestPatch {
                approval_status: Some(summary.status),
                approved_by: Some(summary.approved_by),
                changes_requested_by: Some(summary.changes_requested_by),
                ..Default::default()
            };
            if let Err(e) = self.update_pr(key, patch).await {
                // Reviews can be fetched for a PR the listings never saw.
                log::warn!("approval re-derivation skipped for {}: {}", key, e);
            }
        }

        Ok(reviews)
    }

    /// Fetch a PR's changed files.
    pub async fn fetch_files<F, Fut>(
        &self,
        key: &PrKey,
        force: bool,
        fetch: F,
    ) -> Result<Vec<ChangedFile>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<ChangedFile>, SyncError>>,
    {
        self.files.get_or_fetch(&key.to_string(), force, fetch).await
    }

    /// Fetch a PR's commits.
    pub async fn fetch_commits<F, Fut>(
        &self,
        key: &PrKey,
        force: bool,
        fetch: F,
    ) -> Result<Vec<CommitInfo>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<CommitInfo>, SyncError>>,
    {
        self.commits.get_or_fetch(&key.to_string(), force, fetch).await
    }

    /// Fetch a PR's comments.
    pub async fn fetch_comments<F, Fut>(
        &self,
        key: &PrKey,
        force: bool,
        fetch: F,
    ) -> Result<Vec<Comment>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<Comment>, SyncError>>,
    {
        self.comments.get_or_fetch(&key.to_string(), force, fetch).await
    }

    /// Drop everything. Used at logout.
    pub async fn clear(&self) {
        self.prs.write().await.clear();
        self.list_fetched_at.lock().unwrap().clear();
        *self.last_fetched_repo.lock().unwrap() = None;
        self.key_mutated_at.write().await.clear();
        self.files.clear().await;
        self.commits.clear().await;
        self.comments.clear().await;
        self.reviews.clear().await;
        self.bump_revision();
    }
}

fn to_user(remote: &RemoteUser) -> User {
    User {
        login: remote.login.clone(),
        avatar_url: remote.avatar_url.clone(),
    }
}

fn to_branch_ref(remote: &RemoteRef) -> BranchRef {
    BranchRef {
        name: remote.ref_name.clone(),
        sha: remote.sha.clone(),
    }
}

fn to_labels(remote: &RemotePullRequest) -> Vec<Label> {
    remote
        .labels
        .iter()
        .map(|l| Label {
            name: l.name.clone(),
            color: l.color.clone(),
        })
        .collect()
}

/// Build a fresh cache record from a wire record.
fn from_remote(key: PrKey, remote: &RemotePullRequest) -> PullRequest {
    let mut pr = PullRequest {
        key,
        node_id: remote.node_id.clone(),
        title: remote.title.clone(),
        body: remote.body.clone().unwrap_or_default(),
        state: PrState::from(remote.state.as_str()),
        draft: remote.draft,
        merged: remote.merged_at.is_some(),
        head: to_branch_ref(&remote.head),
        base: to_branch_ref(&remote.base),
        author: to_user(&remote.user),
        assignees: remote.assignees.iter().map(to_user).collect(),
        requested_reviewers: remote
            .requested_reviewers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(to_user)
            .collect(),
        labels: to_labels(remote),
        approval_status: crate::models::ApprovalStatus::None,
        approved_by: Vec::new(),
        changes_requested_by: Vec::new(),
        additions: remote.additions.unwrap_or(0),
        deletions: remote.deletions.unwrap_or(0),
        changed_files: remote.changed_files.unwrap_or(0),
        created_at: remote.created_at,
        updated_at: remote.updated_at,
        closed_at: remote.closed_at,
        merged_at: remote.merged_at,
    };
    pr.normalize();
    pr
}

/// Merge a wire record into an existing cache record.
///
/// Fields the wire record does not carry (`None` on the remote side) keep
/// their cached values, as does the derived approval state, which no listing
/// endpoint returns.
fn merge_remote(existing: &PullRequest, remote: &RemotePullRequest) -> PullRequest {
    let mut pr = existing.clone();
    pr.node_id = remote.node_id.clone();
    pr.title = remote.title.clone();
    pr.body = remote.body.clone().unwrap_or_default();
    pr.state = PrState::from(remote.state.as_str());
    pr.draft = remote.draft;
    pr.merged = remote.merged_at.is_some();
    pr.head = to_branch_ref(&remote.head);
    pr.base = to_branch_ref(&remote.base);
    pr.author = to_user(&remote.user);
    pr.assignees = remote.assignees.iter().map(to_user).collect();
    if let Some(reviewers) = &remote.requested_reviewers {
        pr.requested_reviewers = reviewers.iter().map(to_user).collect();
    }
    pr.labels = to_labels(remote);
    if let Some(additions) = remote.additions {
        pr.additions = additions;
    }
    if let Some(deletions) = remote.deletions {
        pr.deletions = deletions;
    }
    if let Some(changed_files) = remote.changed_files {
        pr.changed_files = changed_files;
    }
    pr.created_at = remote.created_at;
    pr.updated_at = remote.updated_at;
    pr.closed_at = remote.closed_at;
    pr.merged_at = remote.merged_at;
    pr.normalize();
    pr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApprovalStatus, ReviewState};
    use std::sync::Arc;

    fn repo() -> RepoKey {
        RepoKey::new("acme", "widgets")
    }

    fn remote(number: i64) -> RemotePullRequest {
        RemotePullRequest {
            number,
            node_id: format!("PR_node{}", number),
            title: format!("PR {}", number),
            body: Some("Fixes things".to_string()),
            state: "open".to_string(),
            draft: false,
            merged_at: None,
            closed_at: None,
            created_at: "2024-03-01T10:00:00Z".parse().unwrap(),
            updated_at: "2024-03-02T10:00:00Z".parse().unwrap(),
            user: RemoteUser {
                login: "author".to_string(),
                avatar_url: None,
            },
            assignees: Vec::new(),
            requested_reviewers: Some(Vec::new()),
            labels: Vec::new(),
            head: RemoteRef {
                ref_name: format!("feature-{}", number),
                sha: None,
            },
            base: RemoteRef {
                ref_name: "main".to_string(),
                sha: None,
            },
            additions: Some(10),
            deletions: Some(2),
            changed_files: Some(3),
        }
    }

    fn merged_remote(number: i64) -> RemotePullRequest {
        // Shape of the closed-listing payload: no reviewers, no change totals.
        let mut r = remote(number);
        r.state = "closed".to_string();
        r.merged_at = Some("2024-03-03T10:00:00Z".parse().unwrap());
        r.closed_at = r.merged_at;
        r.requested_reviewers = None;
        r.additions = None;
        r.deletions = None;
        r.changed_files = None;
        r
    }

    #[tokio::test]
    async fn test_fetch_open_populates_store() {
        let store = PullRequestStore::default();
        let open = store
            .fetch_open(&repo(), false, || async { Ok(vec![remote(1), remote(2)]) })
            .await
            .unwrap();

        assert_eq!(open.len(), 2);
        assert!(store.get(&repo().pr(1)).await.is_some());
        assert_eq!(store.revision(), 1);
    }

    #[tokio::test]
    async fn test_fresh_listing_served_without_fetch() {
        let store = PullRequestStore::default();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let fetch = |calls: Arc<std::sync::atomic::AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![remote(1)])
        };

        store
            .fetch_open(&repo(), false, || fetch(calls.clone()))
            .await
            .unwrap();
        store
            .fetch_open(&repo(), false, || fetch(calls.clone()))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_merged_listing_does_not_clobber_open_listing_fields() {
        let store = PullRequestStore::default();

        let mut with_reviewers = remote(1);
        with_reviewers.requested_reviewers = Some(vec![RemoteUser {
            login: "reviewer".to_string(),
            avatar_url: None,
        }]);
        store
            .fetch_open(&repo(), false, || async { Ok(vec![with_reviewers]) })
            .await
            .unwrap();

        // The PR gets merged; the closed listing omits reviewers and totals.
        store
            .fetch_recently_merged(&repo(), false, || async { Ok(vec![merged_remote(1)]) })
            .await
            .unwrap();

        let pr = store.get(&repo().pr(1)).await.unwrap();
        assert!(pr.merged);
        assert_eq!(pr.state, PrState::Closed);
        assert_eq!(pr.requested_reviewers.len(), 1);
        assert_eq!(pr.additions, 10);
    }

    #[tokio::test]
    async fn test_refetch_preserves_derived_approval() {
        let store = PullRequestStore::default();
        store
            .fetch_open(&repo(), false, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();

        let key = repo().pr(1);
        store
            .update_pr(
                &key,
                PullRequestPatch {
                    approval_status: Some(ApprovalStatus::Approved),
                    approved_by: Some(vec!["alice".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store
            .fetch_open(&repo(), true, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();

        let pr = store.get(&key).await.unwrap();
        assert_eq!(pr.approval_status, ApprovalStatus::Approved);
        assert_eq!(pr.approved_by, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_stale_fetch_skips_locally_mutated_key() {
        let store = Arc::new(PullRequestStore::default());
        store
            .fetch_open(&repo(), false, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();

        let key = repo().pr(1);
        let inner = store.clone();
        let inner_key = key.clone();

        // The mutation lands while the refetch's response is still in flight;
        // its (older) title must not overwrite the local edit.
        store
            .fetch_open(&repo(), true, move || async move {
                inner
                    .update_pr(
                        &inner_key,
                        PullRequestPatch {
                            title: Some("Edited locally".to_string()),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
                Ok(vec![remote(1)])
            })
            .await
            .unwrap();

        assert_eq!(store.get(&key).await.unwrap().title, "Edited locally");
    }

    #[tokio::test]
    async fn test_fetch_after_mutation_overwrites_again() {
        let store = PullRequestStore::default();
        store
            .fetch_open(&repo(), false, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();

        let key = repo().pr(1);
        store
            .update_pr(
                &key,
                PullRequestPatch {
                    title: Some("Edited locally".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // A fetch issued after the mutation carries newer server truth.
        store
            .fetch_open(&repo(), true, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();

        assert_eq!(store.get(&key).await.unwrap().title, "PR 1");
    }

    #[tokio::test]
    async fn test_update_pr_unknown_key_is_not_found() {
        let store = PullRequestStore::default();
        let err = store
            .update_pr(&repo().pr(99), PullRequestPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_review_fetch_rederives_approval() {
        let store = PullRequestStore::default();
        store
            .fetch_open(&repo(), false, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();

        let key = repo().pr(1);
        store
            .fetch_reviews(&key, false, || async {
                Ok(vec![Review {
                    id: "r1".to_string(),
                    author: User::new("alice"),
                    state: ReviewState::Approved,
                    body: String::new(),
                    submitted_at: Some("2024-03-02T12:00:00Z".parse().unwrap()),
                }])
            })
            .await
            .unwrap();

        let pr = store.get(&key).await.unwrap();
        assert_eq!(pr.approval_status, ApprovalStatus::Approved);
        assert_eq!(pr.approved_by, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_list_failure_keeps_cached_prs() {
        let store = PullRequestStore::default();
        store
            .fetch_open(&repo(), false, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();

        let err = store
            .fetch_open(&repo(), true, || async {
                Err(SyncError::network("connection reset"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Network { .. }));
        assert!(store.get(&repo().pr(1)).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutation_racing_batch_apply_is_never_lost() {
        // The patch and its sequence stamp land atomically, so however a
        // concurrent batch apply interleaves with the mutation, the local
        // edit wins: the batch either sees the stamp and skips the key, or
        // runs entirely before the patch (which then applies on top).
        for _ in 0..100 {
            let store = Arc::new(PullRequestStore::default());
            store
                .fetch_open(&repo(), false, || async { Ok(vec![remote(1)]) })
                .await
                .unwrap();

            let key = repo().pr(1);
            let inner = store.clone();
            let inner_key = key.clone();
            let edit_slot: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>> =
                Arc::new(std::sync::Mutex::new(None));
            let slot = edit_slot.clone();

            store
                .fetch_open(&repo(), true, move || async move {
                    // Spawn the mutation without awaiting it, so it races the
                    // response apply that follows this closure.
                    let edit = tokio::spawn(async move {
                        inner
                            .update_pr(
                                &inner_key,
                                PullRequestPatch {
                                    title: Some("Edited locally".to_string()),
                                    ..Default::default()
                                },
                            )
                            .await
                            .unwrap();
                    });
                    *slot.lock().unwrap() = Some(edit);
                    Ok(vec![remote(1)])
                })
                .await
                .unwrap();

            let edit = edit_slot.lock().unwrap().take().unwrap();
            edit.await.unwrap();
            assert_eq!(store.get(&key).await.unwrap().title, "Edited locally");
        }
    }

    #[tokio::test]
    async fn test_cancelled_list_fetch_releases_the_key() {
        let store = PullRequestStore::default();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(10),
            store.fetch_open(&repo(), false, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(vec![remote(1)])
            }),
        )
        .await;
        assert!(timed_out.is_err());

        // The abandoned fetch must not wedge the list key.
        assert!(!store.is_loading(&repo()).await);
        store
            .fetch_open(&repo(), false, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();
        assert!(store.get(&repo().pr(1)).await.is_some());
    }

    #[tokio::test]
    async fn test_last_fetched_repo_tracks_completed_fetches() {
        let store = PullRequestStore::default();
        assert_eq!(store.last_fetched_repo(), None);

        store
            .fetch_open(&repo(), false, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();
        assert_eq!(store.last_fetched_repo(), Some(repo()));

        let other = RepoKey::new("other", "gadgets");
        store
            .fetch_open(&other, false, || async { Ok(vec![remote(9)]) })
            .await
            .unwrap();
        assert_eq!(store.last_fetched_repo(), Some(other));

        store.clear().await;
        assert_eq!(store.last_fetched_repo(), None);
    }

    #[tokio::test]
    async fn test_clear_empties_everything() {
        let store = PullRequestStore::default();
        store
            .fetch_open(&repo(), false, || async { Ok(vec![remote(1)]) })
            .await
            .unwrap();
        store.clear().await;
        assert!(store.get(&repo().pr(1)).await.is_none());
        assert!(store.all_for_repo(&repo()).await.is_empty());
    }
}
