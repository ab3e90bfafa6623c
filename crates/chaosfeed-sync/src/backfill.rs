//! One-shot historical import.
//!
//! Fills the store from the batch listings in order: pull requests, issues,
//! their reactions, conversation comments and their reactions, stargazers,
//! forks, then discussions. Safe to rerun; dedup in the store absorbs
//! anything already present.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use chaosfeed_core::{EventType, NewEvent, TargetRef};
use chaosfeed_github::{FetchError, GitHubClient, RepoSlug};
use chaosfeed_normalize::{
    normalize_discussion, normalize_fork, normalize_listed_comment, normalize_listed_issue,
    normalize_listed_pull_request, normalize_reaction, normalize_stargazer, ReactionParent,
};
use chaosfeed_store::InsertOutcome;
use serde::Serialize;
use tracing::{info, warn};

use crate::sink::BackfillStore;

/// Quota is re-checked after this many per-item listing calls.
pub const QUOTA_CHECK_EVERY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillOptions {
    /// Delete pull request and issue lifecycle rows before reinserting them,
    /// so a corrected classification replaces what is stored.
    pub replace_lifecycle: bool,
    pub comment_reactions: bool,
    pub discussions: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            replace_lifecycle: false,
            comment_reactions: true,
            discussions: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub fetched: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl StepCounts {
    fn record(&mut self, result: std::result::Result<InsertOutcome, chaosfeed_store::StoreError>) {
        match result {
            Ok(InsertOutcome::Stored { .. }) => self.stored += 1,
            Ok(InsertOutcome::Duplicate) => self.duplicates += 1,
            Err(_) => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub lifecycle_rows_removed: u64,
    pub pull_requests: StepCounts,
    pub issues: StepCounts,
    pub pr_reactions: StepCounts,
    pub issue_reactions: StepCounts,
    pub comments: StepCounts,
    pub comment_reactions: StepCounts,
    pub stars: StepCounts,
    pub forks: StepCounts,
    pub discussions: StepCounts,
    pub duplicates_removed: u64,
}

impl BackfillReport {
    pub fn total_stored(&self) -> usize {
        [
            self.pull_requests,
            self.issues,
            self.pr_reactions,
            self.issue_reactions,
            self.comments,
            self.comment_reactions,
            self.stars,
            self.forks,
            self.discussions,
        ]
        .iter()
        .map(|step| step.stored)
        .sum()
    }
}

async fn insert_all<S>(store: &S, events: &[NewEvent], counts: &mut StepCounts)
where
    S: BackfillStore + ?Sized,
{
    counts.fetched += events.len();
    for event in events {
        let result = store.insert(event).await;
        if let Err(err) = &result {
            warn!(event_type = %event.event_type, error = %err, "backfill insert failed");
        }
        counts.record(result);
    }
}

/// Pauses for quota before every `QUOTA_CHECK_EVERY`th item.
async fn checkpoint(client: &GitHubClient, index: usize) -> Result<()> {
    if index > 0 && index % QUOTA_CHECK_EVERY == 0 {
        client.wait_for_quota().await.context("checking quota")?;
    }
    Ok(())
}

/// Lists and stores the reactions of every parent. A failed listing skips
/// that parent only.
async fn import_reactions<S>(
    client: &GitHubClient,
    store: &S,
    repo: &RepoSlug,
    parents: &[ReactionParent],
    counts: &mut StepCounts,
) -> Result<()>
where
    S: BackfillStore + ?Sized,
{
    for (index, parent) in parents.iter().enumerate() {
        checkpoint(client, index).await?;
        let listed = match *parent {
            ReactionParent::PullRequest(number) | ReactionParent::Issue(number) => {
                client.issue_reactions(repo, number).await
            }
            ReactionParent::Comment { comment_id, .. } => {
                client.comment_reactions(repo, comment_id).await
            }
        };
        let reactions = match listed {
            Ok(reactions) => reactions,
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled.into()),
            Err(err) => {
                warn!(?parent, error = %err, "skipping reactions");
                continue;
            }
        };
        let events: Vec<NewEvent> = reactions
            .iter()
            .map(|r| normalize_reaction(r, *parent))
            .collect();
        insert_all(store, &events, counts).await;
    }
    Ok(())
}

pub async fn run_backfill<S>(
    client: &GitHubClient,
    store: &S,
    repo: &RepoSlug,
    options: BackfillOptions,
) -> Result<BackfillReport>
where
    S: BackfillStore + ?Sized,
{
    let mut report = BackfillReport::default();
    client.wait_for_quota().await.context("checking quota")?;

    if options.replace_lifecycle {
        let lifecycle: Vec<EventType> = EventType::ALL
            .iter()
            .copied()
            .filter(|t| t.is_pull_request_lifecycle() || t.is_issue_lifecycle())
            .collect();
        report.lifecycle_rows_removed = store
            .delete_by_types(&lifecycle)
            .await
            .context("clearing lifecycle rows")?;
        info!(removed = report.lifecycle_rows_removed, "lifecycle rows cleared");
    }

    let pulls = client
        .all_pull_requests(repo)
        .await
        .context("listing pull requests")?;
    let events: Vec<NewEvent> = pulls.iter().map(normalize_listed_pull_request).collect();
    insert_all(store, &events, &mut report.pull_requests).await;
    info!(counts = ?report.pull_requests, "pull requests imported");

    let issues = client.all_issues(repo).await.context("listing issues")?;
    let events: Vec<NewEvent> = issues.iter().map(normalize_listed_issue).collect();
    insert_all(store, &events, &mut report.issues).await;
    info!(counts = ?report.issues, "issues imported");

    let parents: Vec<ReactionParent> = pulls
        .iter()
        .map(|pr| ReactionParent::PullRequest(pr.number))
        .collect();
    import_reactions(client, store, repo, &parents, &mut report.pr_reactions).await?;
    info!(counts = ?report.pr_reactions, "pull request reactions imported");

    let parents: Vec<ReactionParent> = issues
        .iter()
        .map(|issue| ReactionParent::Issue(issue.number))
        .collect();
    import_reactions(client, store, repo, &parents, &mut report.issue_reactions).await?;
    info!(counts = ?report.issue_reactions, "issue reactions imported");

    let comments = client
        .all_issue_comments(repo)
        .await
        .context("listing comments")?;
    let pr_titles: HashMap<i32, &str> = pulls
        .iter()
        .map(|pr| (pr.number, pr.title.as_str()))
        .collect();
    let issue_titles: HashMap<i32, &str> = issues
        .iter()
        .map(|issue| (issue.number, issue.title.as_str()))
        .collect();
    let mut comment_parents: BTreeMap<i64, TargetRef> = BTreeMap::new();
    let mut events = Vec::with_capacity(comments.len());
    for comment in &comments {
        let Some(number) = comment.parent_number() else {
            warn!(comment_id = comment.id, issue_url = %comment.issue_url, "comment without a parent, skipping");
            continue;
        };
        // Anything not listed as a pull request is an issue.
        let (parent, title) = match pr_titles.get(&number) {
            Some(title) => (TargetRef::PullRequest(number), *title),
            None => (
                TargetRef::Issue(number),
                issue_titles.get(&number).copied().unwrap_or_default(),
            ),
        };
        comment_parents.insert(comment.id, parent);
        events.push(normalize_listed_comment(comment, parent, title));
    }
    insert_all(store, &events, &mut report.comments).await;
    info!(counts = ?report.comments, "comments imported");

    if options.comment_reactions {
        // Comments the poller stored but the capped listing missed.
        let stored = store
            .issue_comment_parents()
            .await
            .context("listing stored comments")?;
        for (comment_id, parent) in stored {
            comment_parents.entry(comment_id).or_insert(parent);
        }
        let parents: Vec<ReactionParent> = comment_parents
            .into_iter()
            .map(|(comment_id, parent)| ReactionParent::Comment { comment_id, parent })
            .collect();
        import_reactions(client, store, repo, &parents, &mut report.comment_reactions).await?;
        info!(counts = ?report.comment_reactions, "comment reactions imported");
    }

    let stargazers = client.stargazers(repo).await.context("listing stargazers")?;
    let events: Vec<NewEvent> = stargazers.iter().map(normalize_stargazer).collect();
    insert_all(store, &events, &mut report.stars).await;
    info!(counts = ?report.stars, "stargazers imported");

    let forks = client.forks(repo).await.context("listing forks")?;
    let events: Vec<NewEvent> = forks.iter().map(normalize_fork).collect();
    insert_all(store, &events, &mut report.forks).await;
    info!(counts = ?report.forks, "forks imported");

    if options.discussions {
        match client.discussions(repo).await {
            Ok(discussions) => {
                for discussion in &discussions {
                    let events = normalize_discussion(discussion);
                    insert_all(store, &events, &mut report.discussions).await;
                }
                info!(discussions = discussions.len(), counts = ?report.discussions, "discussions imported");
            }
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled.into()),
            Err(err) => warn!(error = %err, "discussions unavailable, skipping"),
        }
    }

    report.duplicates_removed = store
        .deduplicate_stars_forks()
        .await
        .context("deduplicating stars and forks")?;

    info!(
        stored = report.total_stored(),
        duplicates_removed = report.duplicates_removed,
        "backfill complete"
    );
    Ok(report)
}
