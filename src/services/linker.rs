//! Cross-reference linker between PR text and the external issue tracker.
//!
//! Identifiers are extracted from PR titles and bodies by pluggable matchers,
//! batch-resolved against the tracker, and each resolved issue carries a
//! recomputed projection of the PRs referencing it. The projection is derived
//! from cached PR data on every relink, never stored as an independent
//! relationship.
//!
//! Fetch and relink are scoped to one repository at a time: the linked-PR
//! index is built from the given repo's PRs only, so the issue panel for a
//! repo never shows links into repos outside it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::{broadcast, RwLock};

use crate::error::SyncError;
use crate::models::{ApprovalStatus, ExternalIssue, LinkedPr, PullRequest, RepoKey};
use crate::services::tracker_client::RemoteIssue;

/// How long a resolved issue set stays fresh.
const ISSUE_FRESHNESS: Duration = Duration::from_secs(300);

/// Extracts tracker identifiers from free-form PR text.
///
/// Implementations return canonical (uppercased) identifiers; the linker
/// deduplicates across matchers.
pub trait IssueMatcher: Send + Sync {
    fn extract(&self, text: &str) -> Vec<String>;
}

/// Matches project-prefixed short codes like `ENG-42`.
///
/// The digit requirement is structural: a prefix alone (`ENG-`) or a
/// hyphenated word (`follow-up`) never matches.
pub struct ShortCodeMatcher {
    pattern: Regex,
}

impl ShortCodeMatcher {
    pub fn new() -> Self {
        Self {
            // Case-insensitive; canonical form is uppercase.
            pattern: Regex::new(r"(?i)\b([A-Z][A-Z0-9]{1,9}-\d+)\b").unwrap(),
        }
    }
}

impl Default for ShortCodeMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl IssueMatcher for ShortCodeMatcher {
    fn extract(&self, text: &str) -> Vec<String> {
        self.pattern
            .captures_iter(text)
            .map(|c| c[1].to_uppercase())
            .collect()
    }
}

/// Matches numeric issue ids embedded in tracker URLs.
pub struct UrlIdMatcher {
    pattern: Regex,
}

impl UrlIdMatcher {
    /// Build a matcher for URLs under the given tracker base, e.g.
    /// `https://tracker.example.com/issues`.
    pub fn new(base_url: &str) -> Result<Self, SyncError> {
        let escaped = regex::escape(base_url.trim_end_matches('/'));
        let pattern = Regex::new(&format!(r"{}/(\d+)", escaped))
            .map_err(|e| SyncError::invalid_input(format!("Bad tracker URL pattern: {}", e)))?;
        Ok(Self { pattern })
    }
}

impl IssueMatcher for UrlIdMatcher {
    fn extract(&self, text: &str) -> Vec<String> {
        self.pattern
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect()
    }
}

/// Cache of resolved tracker issues with their linked-PR projections.
pub struct IssueLinker {
    matchers: Vec<Box<dyn IssueMatcher>>,
    /// Keyed by canonical (uppercased) identifier.
    issues: RwLock<HashMap<String, ExternalIssue>>,
    /// Last fetch failure, surfaced to the UI alongside the cached issues.
    error: RwLock<Option<String>>,
    /// Completion time per repository fetch.
    fetched_at: RwLock<HashMap<String, Instant>>,
    /// Repository of the most recently completed fetch.
    last_fetched_repo: RwLock<Option<RepoKey>>,
    freshness: Duration,
    revision: AtomicU64,
    changes: broadcast::Sender<u64>,
}

impl IssueLinker {
    pub fn new(matchers: Vec<Box<dyn IssueMatcher>>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            matchers,
            issues: RwLock::new(HashMap::new()),
            error: RwLock::new(None),
            fetched_at: RwLock::new(HashMap::new()),
            last_fetched_repo: RwLock::new(None),
            freshness: ISSUE_FRESHNESS,
            revision: AtomicU64::new(0),
            changes,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump_revision(&self) {
        let rev = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.changes.send(rev);
    }

    /// The identifiers referenced by the given PRs, canonical and sorted.
    pub fn identifiers_in<'a, I>(&self, prs: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a PullRequest>,
    {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for pr in prs {
            for text in [pr.title.as_str(), pr.body.as_str()] {
                for matcher in &self.matchers {
                    for id in matcher.extract(text) {
                        if seen.insert(id.clone()) {
                            ids.push(id);
                        }
                    }
                }
            }
        }
        ids.sort();
        ids
    }

    /// Resolve the identifiers referenced by the repo's PRs against the
    /// tracker.
    ///
    /// `prs` is the cached PR set to scan; anything in it outside `repo` is
    /// ignored. One batched call; on failure the cached issues stay untouched
    /// and the failure message is kept in [`IssueLinker::error`]. Resolved
    /// records merge into already-cached issues, so a refetch updates title
    /// and status without discarding the linked-PR projection built since.
    pub async fn fetch<F, Fut>(
        &self,
        repo: &RepoKey,
        prs: &[PullRequest],
        force: bool,
        fetch: F,
    ) -> Result<(), SyncError>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<RemoteIssue>, SyncError>>,
    {
        if !force {
            let fetched_at = self.fetched_at.read().await;
            let fresh = fetched_at
                .get(&repo.to_string())
                .map(|at| at.elapsed() < self.freshness)
                .unwrap_or(false);
            if fresh {
                return Ok(());
            }
        }

        let scoped = repo_scoped(repo, prs);
        let identifiers = self.identifiers_in(scoped.iter().copied());

        match fetch(identifiers).await {
            Ok(remotes) => {
                {
                    let mut issues = self.issues.write().await;
                    for remote in remotes {
                        let id = remote.identifier.to_uppercase();
                        match issues.get_mut(&id) {
                            Some(issue) => {
                                issue.title = remote.title;
                                issue.status = remote.status;
                                issue.level = remote.level;
                            }
                            None => {
                                issues.insert(
                                    id.clone(),
                                    ExternalIssue {
                                        identifier: id,
                                        title: remote.title,
                                        status: remote.status,
                                        level: remote.level,
                                        linked_prs: Vec::new(),
                                    },
                                );
                            }
                        }
                    }
                }
                self.fetched_at
                    .write()
                    .await
                    .insert(repo.to_string(), Instant::now());
                *self.last_fetched_repo.write().await = Some(repo.clone());
                *self.error.write().await = None;
                self.relink(repo, prs).await;
                Ok(())
            }
            Err(e) => {
                log::error!("tracker issue fetch failed for {}: {}", repo, e);
                *self.error.write().await = Some(e.to_string());
                self.bump_revision();
                Err(e)
            }
        }
    }

    /// Recompute every issue's linked-PR projection from the repo's cached
    /// PR data.
    ///
    /// Cheap and purely local; run after any PR cache revision change. Only
    /// PRs of `repo` enter the index, so links never span repositories. A
    /// previously derived approval status is kept when the fresh projection
    /// still reads `None`, so a listing refetch that carries no review data
    /// cannot blank an issue card.
    pub async fn relink(&self, repo: &RepoKey, prs: &[PullRequest]) {
        let scoped = repo_scoped(repo, prs);

        // identifier -> referencing PRs
        let mut references: HashMap<String, Vec<&PullRequest>> = HashMap::new();
        for &pr in &scoped {
            let mut seen = HashSet::new();
            for text in [pr.title.as_str(), pr.body.as_str()] {
                for matcher in &self.matchers {
                    for id in matcher.extract(text) {
                        if seen.insert(id.clone()) {
                            references.entry(id).or_default().push(pr);
                        }
                    }
                }
            }
        }

        let mut issues = self.issues.write().await;
        for issue in issues.values_mut() {
            let previous: HashMap<i64, ApprovalStatus> = issue
                .linked_prs
                .iter()
                .map(|l| (l.number, l.approval_status))
                .collect();

            let mut linked: Vec<LinkedPr> = references
                .get(&issue.identifier)
                .map(|prs| prs.iter().map(|pr| LinkedPr::from_pr(pr)).collect())
                .unwrap_or_default();

            for link in &mut linked {
                if link.approval_status == ApprovalStatus::None {
                    if let Some(prev) = previous.get(&link.number) {
                        if *prev != ApprovalStatus::None {
                            link.approval_status = *prev;
                        }
                    }
                }
            }

            linked.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.number.cmp(&a.number)));
            issue.linked_prs = linked;
        }
        drop(issues);
        self.bump_revision();
    }

    /// Case-insensitive issue lookup.
    pub async fn get_issue(&self, identifier: &str) -> Option<ExternalIssue> {
        self.issues
            .read()
            .await
            .get(&identifier.to_uppercase())
            .cloned()
    }

    /// All resolved issues, sorted by identifier.
    pub async fn all_issues(&self) -> Vec<ExternalIssue> {
        let mut issues: Vec<ExternalIssue> = self.issues.read().await.values().cloned().collect();
        issues.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        issues
    }

    /// Last fetch failure, if the cached issues are known to be stale.
    pub async fn error(&self) -> Option<String> {
        self.error.read().await.clone()
    }

    /// Repository of the most recently completed fetch, if any.
    pub async fn last_fetched_repo(&self) -> Option<RepoKey> {
        self.last_fetched_repo.read().await.clone()
    }

    /// Drop everything. Used at logout.
    pub async fn clear(&self) {
        self.issues.write().await.clear();
        *self.error.write().await = None;
        self.fetched_at.write().await.clear();
        *self.last_fetched_repo.write().await = None;
        self.bump_revision();
    }
}

fn repo_scoped<'a>(repo: &RepoKey, prs: &'a [PullRequest]) -> Vec<&'a PullRequest> {
    prs.iter()
        .filter(|pr| pr.key.owner == repo.owner && pr.key.repo == repo.repo)
        .collect()
}
