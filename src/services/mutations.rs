//! Optimistic mutation layer.
//!
//! Every user action applies to the cache first and then calls the remote
//! API, so the UI reflects the action immediately. Expected API constraints
//! (duplicate reviewer request, requesting a review from the author, removing
//! an absent label) are warnings, not failures. Unexpected failures are
//! logged and propagated with the optimistic state left in place; the caller
//! owns the rollback UX. The two exceptions are placeholder records that can
//! never be reconciled (a failed comment or review post) and the explicitly
//! rolled-back author-reviewer case.
//!
//! Remote calls are passed in as closures so the cache semantics stay
//! testable without a live forge.

use crate::error::SyncError;
use crate::models::{
    summarize_reviews, Comment, Label, PrKey, PullRequestPatch, Review, ReviewState, User,
};
use crate::services::pr_store::PullRequestStore;

/// Map a review verdict onto the forge's review-event wire value.
pub fn review_event(state: ReviewState) -> &'static str {
    match state {
        ReviewState::Approved => "APPROVE",
        ReviewState::ChangesRequested => "REQUEST_CHANGES",
        _ => "COMMENT",
    }
}

/// Add a label to a PR.
///
/// Idempotent locally: adding a label the PR already carries changes nothing.
pub async fn add_label<F, Fut>(
    store: &PullRequestStore,
    key: &PrKey,
    label: Label,
    remote: F,
) -> Result<(), SyncError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), SyncError>>,
{
    let pr = store
        .get(key)
        .await
        .ok_or_else(|| SyncError::not_found_with_id("pull request", key.to_string()))?;

    if !pr.labels.iter().any(|l| l.name == label.name) {
        let mut labels = pr.labels.clone();
        labels.push(label);
        store
            .update_pr(
                key,
                PullRequestPatch {
                    labels: Some(labels),
                    ..Default::default()
                },
            )
            .await?;
    }

    match remote().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_constraint() => {
            log::warn!("label add on {} hit a constraint: {}", key, e);
            Ok(())
        }
        Err(e) => {
            log::error!("label add on {} failed: {}", key, e);
            Err(e)
        }
    }
}

/// Remove a label from a PR.
///
/// A "label does not exist" constraint means the desired end state already
/// holds, so it degrades to a warning.
pub async fn remove_label<F, Fut>(
    store: &PullRequestStore,
    key: &PrKey,
    label_name: &str,
    remote: F,
) -> Result<(), SyncError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), SyncError>>,
{
    let pr = store
        .get(key)
        .await
        .ok_or_else(|| SyncError::not_found_with_id("pull request", key.to_string()))?;

    let labels: Vec<Label> = pr
        .labels
        .iter()
        .filter(|l| l.name != label_name)
        .cloned()
        .collect();
    store
        .update_pr(
            key,
            PullRequestPatch {
                labels: Some(labels),
                ..Default::default()
            },
        )
        .await?;

    match remote().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_constraint() => {
            log::warn!("label removal on {} hit a constraint: {}", key, e);
            Ok(())
        }
        Err(e) => {
            log::error!("label removal on {} failed: {}", key, e);
            Err(e)
        }
    }
}

/// Request a review from a user.
///
/// The forge rejects requests targeting the PR author; that constraint rolls
/// the optimistic append back. A duplicate-request constraint leaves it in
/// place, since the reviewer genuinely is requested.
pub async fn request_reviewer<F, Fut>(
    store: &PullRequestStore,
    key: &PrKey,
    reviewer: User,
    remote: F,
) -> Result<(), SyncError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), SyncError>>,
{
    let pr = store
        .get(key)
        .await
        .ok_or_else(|| SyncError::not_found_with_id("pull request", key.to_string()))?;

    let login = reviewer.login.clone();
    let already_requested = pr.requested_reviewers.iter().any(|u| u.login == login);
    let previous = pr.requested_reviewers.clone();

    if !already_requested {
        let mut reviewers = previous.clone();
        reviewers.push(reviewer);
        store
            .update_pr(
                key,
                PullRequestPatch {
                    requested_reviewers: Some(reviewers),
                    ..Default::default()
                },
            )
            .await?;
    }

    match remote().await {
        Ok(()) => Ok(()),
        Err(SyncError::Constraint { message }) => {
            log::warn!("reviewer request on {} hit a constraint: {}", key, message);
            if message.to_lowercase().contains("author") && !already_requested {
                store
                    .update_pr(
                        key,
                        PullRequestPatch {
                            requested_reviewers: Some(previous),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Ok(())
        }
        Err(e) => {
            log::error!("reviewer request on {} failed: {}", key, e);
            Err(e)
        }
    }
}

/// Post a comment.
///
/// A placeholder with a `local-` id shows up immediately and is swapped for
/// the server echo; on failure the placeholder is removed, since no echo will
/// ever reconcile it.
pub async fn post_comment<F, Fut>(
    store: &PullRequestStore,
    key: &PrKey,
    author: User,
    body: &str,
    remote: F,
) -> Result<Comment, SyncError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Comment, SyncError>>,
{
    let local = Comment::local(author, body);
    let local_id = local.id.clone();
    let cache_key = key.to_string();

    let appended = {
        let local = local.clone();
        store
            .comments()
            .update(&cache_key, |comments| comments.push(local))
            .await
    };
    if !appended {
        store.comments().insert(&cache_key, vec![local]).await;
    }

    match remote().await {
        Ok(echo) => {
            let replaced = echo.clone();
            store
                .comments()
                .update(&cache_key, |comments| {
                    if let Some(slot) = comments.iter_mut().find(|c| c.id == local_id) {
                        *slot = replaced;
                    }
                })
                .await;
            Ok(echo)
        }
        Err(e) => {
            log::error!("comment post on {} failed: {}", key, e);
            store
                .comments()
                .update(&cache_key, |comments| {
                    comments.retain(|c| c.id != local_id);
                })
                .await;
            Err(e)
        }
    }
}

/// Submit a review and re-derive the PR's approval status from the updated
/// review list.
pub async fn post_review<F, Fut>(
    store: &PullRequestStore,
    key: &PrKey,
    author: User,
    state: ReviewState,
    body: &str,
    remote: F,
) -> Result<Review, SyncError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Review, SyncError>>,
{
    let local = Review::local(author, state, body);
    let local_id = local.id.clone();
    let cache_key = key.to_string();

    let appended = {
        let local = local.clone();
        store
            .reviews()
            .update(&cache_key, |reviews| reviews.push(local))
            .await
    };
    if !appended {
        store.reviews().insert(&cache_key, vec![local]).await;
    }
    rederive_approval(store, key).await;

    match remote().await {
        Ok(echo) => {
            let replaced = echo.clone();
            store
                .reviews()
                .update(&cache_key, |reviews| {
                    if let Some(slot) = reviews.iter_mut().find(|r| r.id == local_id) {
                        *slot = replaced;
                    }
                })
                .await;
            rederive_approval(store, key).await;
            Ok(echo)
        }
        Err(e) => {
            log::error!("review post on {} failed: {}", key, e);
            store
                .reviews()
                .update(&cache_key, |reviews| {
                    reviews.retain(|r| r.id != local_id);
                })
                .await;
            rederive_approval(store, key).await;
            Err(e)
        }
    }
}

async fn rederive_approval(store: &PullRequestStore, key: &PrKey) {
    let Some(reviews) = store.reviews().get(&key.to_string()).await else {
        return;
    };
    let summary = summarize_reviews(&reviews);
    let patch = PullRequestPatch {
        approval_status: Some(summary.status),
        approved_by: Some(summary.approved_by),
        changes_requested_by: Some(summary.changes_requested_by),
        ..Default::default()
    };
    if let Err(e) = store.update_pr(key, patch).await {
        log::warn!("approval re-derivation skipped for {}: {}", key, e);
    }
}

/// Toggle a PR's draft flag.
///
/// The remote closure receives the target flag and returns the server's
/// resulting flag; the cached record is kept and only the draft flag is
/// overwritten, so derived and slow-to-fetch fields survive without a
/// refetch.
pub async fn toggle_draft<F, Fut>(
    store: &PullRequestStore,
    key: &PrKey,
    remote: F,
) -> Result<bool, SyncError>
where
    F: FnOnce(bool) -> Fut,
    Fut: std::future::Future<Output = Result<bool, SyncError>>,
{
    let pr = store
        .get(key)
        .await
        .ok_or_else(|| SyncError::not_found_with_id("pull request", key.to_string()))?;

    let target = !pr.draft;
    store
        .update_pr(
            key,
            PullRequestPatch {
                draft: Some(target),
                ..Default::default()
            },
        )
        .await?;

    match remote(target).await {
        Ok(server_draft) => {
            if server_draft != target {
                store
                    .update_pr(
                        key,
                        PullRequestPatch {
                            draft: Some(server_draft),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Ok(server_draft)
        }
        Err(e) => {
            log::error!("draft toggle on {} failed: {}", key, e);
            Err(e)
        }
    }
}

/// Edit a PR's description, reconciling with the server echo.
pub async fn edit_description<F, Fut>(
    store: &PullRequestStore,
    key: &PrKey,
    body: &str,
    remote: F,
) -> Result<(), SyncError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, SyncError>>,
{
    store
        .update_pr(
            key,
            PullRequestPatch {
                body: Some(body.to_string()),
                ..Default::default()
            },
        )
        .await?;

    match remote().await {
        Ok(echo) => {
            if echo != body {
                store
                    .update_pr(
                        key,
                        PullRequestPatch {
                            body: Some(echo),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Ok(())
        }
        Err(e) => {
            log::error!("description edit on {} failed: {}", key, e);
            Err(e)
        }
    }
}
