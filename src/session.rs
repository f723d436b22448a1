//! The synchronization session.
//!
//! One [`SyncSession`] is constructed at login and owns every cache store,
//! both remote clients, and the settings pool. Lifecycle is explicit: the UI
//! shell holds the session for as long as the user is signed in and calls
//! [`SyncSession::reset`] at logout. After any operation that changes the PR
//! cache, the session re-derives the tracker issue links, so link cards stay
//! consistent without the UI polling revision counters (which remain
//! available, with broadcast subscriptions, for render scheduling).

use std::sync::Arc;

use chrono::Utc;

use crate::db::pool::DbPool;
use crate::db::settings::{self, Team};
use crate::error::SyncError;
use crate::models::{
    Activity, BranchRef, ChangedFile, Comment, CommitInfo, ExternalIssue, Label, PrKey, PrState,
    PullRequest, PullRequestPatch, RepoKey, Review, ReviewState, User,
};
use crate::services::activity;
use crate::services::github_client::{
    GitHubClient, RemoteBranch, RemoteComment, RemoteCommit, RemoteFile, RemoteLabel, RemoteReview,
    RemoteUser,
};
use crate::services::linker::{IssueLinker, IssueMatcher};
use crate::services::mutations;
use crate::services::pr_store::PullRequestStore;
use crate::services::repo_meta::RepoMetaStore;
use crate::services::tracker_client::TrackerClient;

/// Owns all synchronization state for one signed-in user.
pub struct SyncSession {
    github: GitHubClient,
    tracker: TrackerClient,
    current_user: User,
    prs: Arc<PullRequestStore>,
    linker: Arc<IssueLinker>,
    meta: Arc<RepoMetaStore>,
    db: DbPool,
}

impl SyncSession {
    pub fn new(
        github: GitHubClient,
        tracker: TrackerClient,
        current_user: User,
        matchers: Vec<Box<dyn IssueMatcher>>,
        db: DbPool,
    ) -> Self {
        Self {
            github,
            tracker,
            current_user,
            prs: Arc::new(PullRequestStore::default()),
            linker: Arc::new(IssueLinker::new(matchers)),
            meta: Arc::new(RepoMetaStore::new()),
            db,
        }
    }

    pub fn prs(&self) -> &Arc<PullRequestStore> {
        &self.prs
    }

    pub fn linker(&self) -> &Arc<IssueLinker> {
        &self.linker
    }

    pub fn meta(&self) -> &Arc<RepoMetaStore> {
        &self.meta
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    /// Recompute the repo's issue links from the cached PR data.
    async fn relink_repo(&self, repo: &RepoKey) {
        let prs = self.prs.all_for_repo(repo).await;
        self.linker.relink(repo, &prs).await;
    }

    // ---- fetching ----

    /// Fetch a repository's open PRs into the cache.
    pub async fn fetch_pull_requests(
        &self,
        repo: &RepoKey,
        force: bool,
    ) -> Result<Vec<PullRequest>, SyncError> {
        let open = self
            .prs
            .fetch_open(repo, force, || async {
                self.github
                    .list_pull_requests(&repo.owner, &repo.repo, "open")
                    .await
            })
            .await?;
        self.relink_repo(repo).await;
        Ok(open)
    }

    /// Fetch PRs merged within the last `days` days into the cache.
    pub async fn fetch_recently_merged(
        &self,
        repo: &RepoKey,
        days: i64,
        force: bool,
    ) -> Result<Vec<PullRequest>, SyncError> {
        let merged = self
            .prs
            .fetch_recently_merged(repo, force, || async {
                self.github
                    .list_recently_merged(&repo.owner, &repo.repo, days)
                    .await
            })
            .await?;
        self.relink_repo(repo).await;
        Ok(merged)
    }

    /// Refresh every feed source: open and recently merged PRs for each
    /// selected feed repo, fetched concurrently.
    ///
    /// One repository failing must not starve the rest of the feed; failures
    /// are logged per repo and the first one is reported after all fetches
    /// settle.
    pub async fn refresh_feed(&self, days: i64, force: bool) -> Result<(), SyncError> {
        let repos = self.feed_repos().await?;

        let fetches = repos.iter().map(|repo| async move {
            self.fetch_pull_requests(repo, force).await?;
            self.fetch_recently_merged(repo, days, force).await?;
            Ok::<(), SyncError>(())
        });

        let mut first_err = None;
        for (repo, result) in repos.iter().zip(futures::future::join_all(fetches).await) {
            if let Err(e) = result {
                log::warn!("feed refresh failed for {}: {}", repo, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fetch a PR's changed files.
    pub async fn fetch_files(
        &self,
        key: &PrKey,
        force: bool,
    ) -> Result<Vec<ChangedFile>, SyncError> {
        self.prs
            .fetch_files(key, force, || async {
                let files = self
                    .github
                    .list_files(&key.owner, &key.repo, key.number)
                    .await?;
                Ok(files.iter().map(to_file).collect())
            })
            .await
    }

    /// Fetch a PR's commits.
    pub async fn fetch_commits(
        &self,
        key: &PrKey,
        force: bool,
    ) -> Result<Vec<CommitInfo>, SyncError> {
        self.prs
            .fetch_commits(key, force, || async {
                let commits = self
                    .github
                    .list_commits(&key.owner, &key.repo, key.number)
                    .await?;
                Ok(commits.iter().map(to_commit).collect())
            })
            .await
    }

    /// Fetch a PR's comments.
    pub async fn fetch_comments(
        &self,
        key: &PrKey,
        force: bool,
    ) -> Result<Vec<Comment>, SyncError> {
        self.prs
            .fetch_comments(key, force, || async {
                let comments = self
                    .github
                    .list_comments(&key.owner, &key.repo, key.number)
                    .await?;
                Ok(comments.iter().map(to_comment).collect())
            })
            .await
    }

    /// Fetch a PR's reviews, re-deriving its approval status.
    pub async fn fetch_reviews(&self, key: &PrKey, force: bool) -> Result<Vec<Review>, SyncError> {
        let reviews = self
            .prs
            .fetch_reviews(key, force, || async {
                let reviews = self
                    .github
                    .list_reviews(&key.owner, &key.repo, key.number)
                    .await?;
                Ok(reviews.iter().map(to_review).collect())
            })
            .await?;
        self.relink_repo(&key.repo_key()).await;
        Ok(reviews)
    }

    /// Fetch an organization's members (hour-long freshness window).
    pub async fn fetch_org_members(&self, org: &str, force: bool) -> Result<Vec<User>, SyncError> {
        self.meta
            .fetch_members(org, force, || async {
                let members = self.github.list_org_members(org).await?;
                Ok(members.iter().map(to_user).collect())
            })
            .await
    }

    /// Fetch a repository's label definitions.
    pub async fn fetch_repo_labels(
        &self,
        repo: &RepoKey,
        force: bool,
    ) -> Result<Vec<Label>, SyncError> {
        self.meta
            .fetch_labels(repo, force, || async {
                let labels = self.github.list_labels(&repo.owner, &repo.repo).await?;
                Ok(labels.iter().map(to_label).collect())
            })
            .await
    }

    /// Fetch a repository's branches.
    pub async fn fetch_branches(
        &self,
        repo: &RepoKey,
        force: bool,
    ) -> Result<Vec<BranchRef>, SyncError> {
        self.meta
            .fetch_branches(repo, force, || async {
                let branches = self.github.list_branches(&repo.owner, &repo.repo).await?;
                Ok(branches.iter().map(to_branch).collect())
            })
            .await
    }

    // ---- optimistic mutations ----

    /// Optimistic shallow merge into a cached PR.
    pub async fn update_pr(
        &self,
        key: &PrKey,
        patch: PullRequestPatch,
    ) -> Result<PullRequest, SyncError> {
        let updated = self.prs.update_pr(key, patch).await?;
        self.relink_repo(&key.repo_key()).await;
        Ok(updated)
    }

    /// Add a label to a PR.
    pub async fn add_label(&self, key: &PrKey, label: Label) -> Result<(), SyncError> {
        let name = label.name.clone();
        mutations::add_label(&self.prs, key, label, || async {
            self.github
                .add_labels(&key.owner, &key.repo, key.number, &[name])
                .await
                .map(|_| ())
        })
        .await?;
        self.relink_repo(&key.repo_key()).await;
        Ok(())
    }

    /// Remove a label from a PR.
    pub async fn remove_label(&self, key: &PrKey, label_name: &str) -> Result<(), SyncError> {
        mutations::remove_label(&self.prs, key, label_name, || async {
            self.github
                .remove_label(&key.owner, &key.repo, key.number, label_name)
                .await
        })
        .await?;
        self.relink_repo(&key.repo_key()).await;
        Ok(())
    }

    /// Request a review from a user.
    pub async fn request_reviewer(&self, key: &PrKey, reviewer: User) -> Result<(), SyncError> {
        let login = reviewer.login.clone();
        mutations::request_reviewer(&self.prs, key, reviewer, || async {
            self.github
                .request_reviewers(&key.owner, &key.repo, key.number, &[login])
                .await
                .map(|_| ())
        })
        .await?;
        self.relink_repo(&key.repo_key()).await;
        Ok(())
    }

    /// Post a comment as the signed-in user.
    pub async fn post_comment(&self, key: &PrKey, body: &str) -> Result<Comment, SyncError> {
        mutations::post_comment(&self.prs, key, self.current_user.clone(), body, || async {
            let echo = self
                .github
                .create_comment(&key.owner, &key.repo, key.number, body)
                .await?;
            Ok(to_comment(&echo))
        })
        .await
    }

    /// Submit a review as the signed-in user.
    pub async fn post_review(
        &self,
        key: &PrKey,
        state: ReviewState,
        body: &str,
    ) -> Result<Review, SyncError> {
        let review = mutations::post_review(
            &self.prs,
            key,
            self.current_user.clone(),
            state,
            body,
            || async {
                let echo = self
                    .github
                    .create_review(
                        &key.owner,
                        &key.repo,
                        key.number,
                        mutations::review_event(state),
                        body,
                    )
                    .await?;
                Ok(to_review(&echo))
            },
        )
        .await?;
        self.relink_repo(&key.repo_key()).await;
        Ok(review)
    }

    /// Toggle a PR's draft flag.
    pub async fn toggle_draft(&self, key: &PrKey) -> Result<bool, SyncError> {
        let pr = self
            .prs
            .get(key)
            .await
            .ok_or_else(|| SyncError::not_found_with_id("pull request", key.to_string()))?;
        let node_id = pr.node_id;

        let draft = mutations::toggle_draft(&self.prs, key, |target| {
            let node_id = node_id.clone();
            async move { self.github.set_draft(&node_id, target).await }
        })
        .await?;
        self.relink_repo(&key.repo_key()).await;
        Ok(draft)
    }

    /// Edit a PR's description.
    pub async fn edit_description(&self, key: &PrKey, body: &str) -> Result<(), SyncError> {
        mutations::edit_description(&self.prs, key, body, || async {
            let echo = self
                .github
                .update_pull_request(
                    &key.owner,
                    &key.repo,
                    key.number,
                    &serde_json::json!({ "body": body }),
                )
                .await?;
            Ok(echo.body.unwrap_or_default())
        })
        .await
    }

    /// Merge a PR. The cached record is patched rather than refetched.
    pub async fn merge_pr(&self, key: &PrKey) -> Result<(), SyncError> {
        self.github
            .merge_pull_request(&key.owner, &key.repo, key.number)
            .await?;

        let now = Utc::now();
        self.prs
            .update_pr(
                key,
                PullRequestPatch {
                    state: Some(PrState::Closed),
                    merged: Some(true),
                    merged_at: Some(Some(now)),
                    closed_at: Some(Some(now)),
                    updated_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        self.relink_repo(&key.repo_key()).await;
        Ok(())
    }

    // ---- tracker issues ----

    /// Resolve tracker issues referenced by the repo's cached PRs.
    pub async fn fetch_issues(&self, repo: &RepoKey, force: bool) -> Result<(), SyncError> {
        let prs = self.prs.all_for_repo(repo).await;
        self.linker
            .fetch(repo, &prs, force, |ids| async move {
                self.tracker.fetch_issues_by_identifiers(&ids).await
            })
            .await
    }

    /// Recompute the repo's issue links from cached PR data, without
    /// touching the tracker.
    pub async fn relink_issues(&self, repo: &RepoKey) {
        self.relink_repo(repo).await;
    }

    /// Case-insensitive issue lookup.
    pub async fn get_issue(&self, identifier: &str) -> Option<ExternalIssue> {
        self.linker.get_issue(identifier).await
    }

    // ---- derived views ----

    /// The activity feed derived from the current PR cache.
    pub async fn activity_feed(&self) -> Vec<Activity> {
        activity::project(&self.prs.snapshot().await)
    }

    // ---- persisted settings ----

    pub async fn get_setting<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, SyncError> {
        settings::get_setting(&self.db, key).await
    }

    pub async fn set_setting<T: serde::Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), SyncError> {
        settings::set_setting(&self.db, key, value).await
    }

    pub async fn feed_repos(&self) -> Result<Vec<RepoKey>, SyncError> {
        settings::list_feed_repos(&self.db).await
    }

    pub async fn add_feed_repo(&self, repo: &RepoKey) -> Result<(), SyncError> {
        settings::add_feed_repo(&self.db, repo).await
    }

    pub async fn remove_feed_repo(&self, repo: &RepoKey) -> Result<(), SyncError> {
        settings::remove_feed_repo(&self.db, repo).await
    }

    pub async fn followed_users(&self) -> Result<Vec<String>, SyncError> {
        settings::list_followed_users(&self.db).await
    }

    pub async fn follow_user(&self, login: &str) -> Result<(), SyncError> {
        settings::follow_user(&self.db, login).await
    }

    pub async fn unfollow_user(&self, login: &str) -> Result<(), SyncError> {
        settings::unfollow_user(&self.db, login).await
    }

    pub async fn teams(&self) -> Result<Vec<Team>, SyncError> {
        settings::list_teams(&self.db).await
    }

    pub async fn save_team(&self, team: &Team) -> Result<(), SyncError> {
        settings::save_team(&self.db, team).await
    }

    pub async fn delete_team(&self, name: &str) -> Result<(), SyncError> {
        settings::delete_team(&self.db, name).await
    }

    /// Drop all in-memory caches. Persisted settings survive; called at
    /// logout.
    pub async fn reset(&self) {
        self.prs.clear().await;
        self.linker.clear().await;
        self.meta.clear().await;
    }
}

// Wire-to-model conversions for sub-collection and metadata records.

fn to_user(remote: &RemoteUser) -> User {
    User {
        login: remote.login.clone(),
        avatar_url: remote.avatar_url.clone(),
    }
}

fn to_label(remote: &RemoteLabel) -> Label {
    Label {
        name: remote.name.clone(),
        color: remote.color.clone(),
    }
}

fn to_branch(remote: &RemoteBranch) -> BranchRef {
    BranchRef {
        name: remote.name.clone(),
        sha: Some(remote.commit.sha.clone()),
    }
}

fn to_file(remote: &RemoteFile) -> ChangedFile {
    ChangedFile {
        path: remote.filename.clone(),
        status: remote.status.clone(),
        additions: remote.additions,
        deletions: remote.deletions,
    }
}

fn to_commit(remote: &RemoteCommit) -> CommitInfo {
    CommitInfo {
        sha: remote.sha.clone(),
        message: remote.commit.message.clone(),
    }
}

fn to_comment(remote: &RemoteComment) -> Comment {
    Comment {
        id: remote.id.to_string(),
        author: to_user(&remote.user),
        body: remote.body.clone(),
        created_at: remote.created_at,
        updated_at: remote.updated_at,
    }
}

fn to_review(remote: &RemoteReview) -> Review {
    Review {
        id: remote.id.to_string(),
        author: to_user(&remote.user),
        state: ReviewState::from(remote.state.as_str()),
        body: remote.body.clone().unwrap_or_default(),
        submitted_at: remote.submitted_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::github_client::GitHubClientConfig;
    use crate::services::linker::ShortCodeMatcher;
    use crate::services::tracker_client::TrackerClientConfig;
    use tempfile::tempdir;

    async fn session(dir: &std::path::Path) -> SyncSession {
        let db = crate::db::initialize(&dir.join("test.db")).await.unwrap();
        SyncSession::new(
            GitHubClient::new(GitHubClientConfig::default()).unwrap(),
            TrackerClient::new(TrackerClientConfig::default()).unwrap(),
            User::new("me"),
            vec![Box::new(ShortCodeMatcher::new())],
            db,
        )
    }

    #[tokio::test]
    async fn test_feed_repo_settings_round_trip() {
        let dir = tempdir().unwrap();
        let session = session(dir.path()).await;

        let repo = RepoKey::new("acme", "widgets");
        session.add_feed_repo(&repo).await.unwrap();
        session.add_feed_repo(&repo).await.unwrap();

        assert_eq!(session.feed_repos().await.unwrap(), vec![repo.clone()]);

        session.remove_feed_repo(&repo).await.unwrap();
        assert!(session.feed_repos().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_caches_but_not_settings() {
        let dir = tempdir().unwrap();
        let session = session(dir.path()).await;

        session
            .add_feed_repo(&RepoKey::new("acme", "widgets"))
            .await
            .unwrap();
        session.reset().await;

        assert!(session.activity_feed().await.is_empty());
        assert_eq!(session.feed_repos().await.unwrap().len(), 1);
    }
}
