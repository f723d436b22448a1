//! Activity feed projection.
//!
//! Replays the PR cache into a flat, time-ordered event list. Pure and
//! stateless: the same cache contents always yield the same feed, so the
//! caller simply re-runs it after any PR cache revision change.

use std::collections::HashMap;

use crate::models::{Activity, ActivityKind, PrKey, PullRequest, ReviewState};

/// Derive the event feed from the cached PR map.
///
/// One `Opened` event per PR, a `Merged` or `Closed` event for finished PRs
/// (merged wins), and one `Review` event per captured approver and
/// changes-requester. Newest first, with a total tiebreak order so equal
/// timestamps cannot reshuffle between runs.
pub fn project(prs: &HashMap<PrKey, PullRequest>) -> Vec<Activity> {
    let mut events = Vec::new();

    for pr in prs.values() {
        events.push(Activity {
            kind: ActivityKind::Opened,
            timestamp: pr.created_at,
            pr: pr.key.clone(),
            title: pr.title.clone(),
            actor: Some(pr.author.login.clone()),
            review_state: None,
        });

        if let Some(merged_at) = pr.merged_at {
            events.push(Activity {
                kind: ActivityKind::Merged,
                timestamp: merged_at,
                pr: pr.key.clone(),
                title: pr.title.clone(),
                actor: None,
                review_state: None,
            });
        } else if let Some(closed_at) = pr.closed_at {
            if !pr.is_open() {
                events.push(Activity {
                    kind: ActivityKind::Closed,
                    timestamp: closed_at,
                    pr: pr.key.clone(),
                    title: pr.title.clone(),
                    actor: None,
                    review_state: None,
                });
            }
        }

        for approver in &pr.approved_by {
            events.push(Activity {
                kind: ActivityKind::Review,
                timestamp: pr.updated_at,
                pr: pr.key.clone(),
                title: pr.title.clone(),
                actor: Some(approver.clone()),
                review_state: Some(ReviewState::Approved),
            });
        }
        for requester in &pr.changes_requested_by {
            events.push(Activity {
                kind: ActivityKind::Review,
                timestamp: pr.updated_at,
                pr: pr.key.clone(),
                title: pr.title.clone(),
                actor: Some(requester.clone()),
                review_state: Some(ReviewState::ChangesRequested),
            });
        }
    }

    events.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.pr.owner.cmp(&b.pr.owner))
            .then_with(|| a.pr.repo.cmp(&b.pr.repo))
            .then_with(|| a.pr.number.cmp(&b.pr.number))
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| a.actor.cmp(&b.actor))
    });
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pull_request::test_fixtures::pr;
    use crate::models::PrState;

    fn map(prs: Vec<PullRequest>) -> HashMap<PrKey, PullRequest> {
        prs.into_iter().map(|pr| (pr.key.clone(), pr)).collect()
    }

    #[test]
    fn test_open_pr_yields_one_event() {
        let events = project(&map(vec![pr("acme", "widgets", 1)]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ActivityKind::Opened);
        assert_eq!(events[0].actor.as_deref(), Some("author"));
    }

    #[test]
    fn test_merged_pr_yields_opened_and_merged() {
        let mut merged = pr("acme", "widgets", 1);
        merged.merged = true;
        merged.state = PrState::Closed;
        merged.merged_at = Some("2024-03-05T10:00:00Z".parse().unwrap());
        merged.closed_at = merged.merged_at;

        let events = project(&map(vec![merged]));
        let kinds: Vec<ActivityKind> = events.iter().map(|e| e.kind).collect();
        // Newest first: the merge happened after the opening.
        assert_eq!(kinds, vec![ActivityKind::Merged, ActivityKind::Opened]);
    }

    #[test]
    fn test_closed_unmerged_pr_yields_closed_not_merged() {
        let mut closed = pr("acme", "widgets", 1);
        closed.state = PrState::Closed;
        closed.closed_at = Some("2024-03-05T10:00:00Z".parse().unwrap());

        let events = project(&map(vec![closed]));
        assert!(events.iter().any(|e| e.kind == ActivityKind::Closed));
        assert!(!events.iter().any(|e| e.kind == ActivityKind::Merged));
    }

    #[test]
    fn test_review_events_per_captured_reviewer() {
        let mut reviewed = pr("acme", "widgets", 1);
        reviewed.approved_by = vec!["alice".to_string()];
        reviewed.changes_requested_by = vec!["bob".to_string()];

        let events = project(&map(vec![reviewed]));
        let reviews: Vec<&Activity> = events
            .iter()
            .filter(|e| e.kind == ActivityKind::Review)
            .collect();
        assert_eq!(reviews.len(), 2);
        assert!(reviews
            .iter()
            .any(|e| e.actor.as_deref() == Some("alice")
                && e.review_state == Some(ReviewState::Approved)));
        assert!(reviews
            .iter()
            .any(|e| e.actor.as_deref() == Some("bob")
                && e.review_state == Some(ReviewState::ChangesRequested)));
    }

    #[test]
    fn test_projection_is_deterministic() {
        // Same creation timestamp everywhere: only the tiebreak order holds.
        let prs = map(vec![
            pr("acme", "widgets", 3),
            pr("acme", "widgets", 1),
            pr("acme", "gadgets", 2),
        ]);

        let first = project(&prs);
        for _ in 0..10 {
            assert_eq!(project(&prs), first);
        }
        let numbers: Vec<i64> = first.iter().map(|e| e.pr.number).collect();
        assert_eq!(numbers, vec![2, 1, 3]);
    }
}
