//! Canonical events from listing endpoints and the discussions graph.

use chaosfeed_core::{
    classify_issue_action, classify_pull_request_state, Actor, EventType, NewEvent, TargetRef,
};
use chaosfeed_github::{
    Discussion, DiscussionReaction, Fork, GraphQlAuthor, IssueComment, IssueSummary,
    PullRequestSummary, Reaction, Stargazer, UserRef,
};
use serde_json::json;

const GHOST_LOGIN: &str = "ghost";

/// What a listed reaction was attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionParent {
    PullRequest(i32),
    Issue(i32),
    /// A comment under `parent`. Carries a comment id, so it never counts as a vote on the parent.
    Comment { comment_id: i64, parent: TargetRef },
}

fn user_actor(user: Option<&UserRef>) -> Actor {
    match user {
        Some(user) => Actor::new(user.login.clone(), user.id),
        None => Actor::new(GHOST_LOGIN, 0),
    }
}

fn author_actor(author: Option<&GraphQlAuthor>) -> Actor {
    // The graph endpoint does not return numeric user ids here.
    Actor::new(
        author.map_or(GHOST_LOGIN, |a| a.login.as_str()).to_string(),
        0,
    )
}

/// GraphQL reaction enums mapped to REST content names so votes line up
/// across endpoints.
pub fn rest_reaction_content(graphql: &str) -> &str {
    match graphql {
        "THUMBS_UP" => "+1",
        "THUMBS_DOWN" => "-1",
        "LAUGH" => "laugh",
        "HOORAY" => "hooray",
        "CONFUSED" => "confused",
        "HEART" => "heart",
        "ROCKET" => "rocket",
        "EYES" => "eyes",
        other => other,
    }
}

pub fn normalize_reaction(reaction: &Reaction, parent: ReactionParent) -> NewEvent {
    let mut payload = json!({
        "id": reaction.id,
        "content": reaction.content,
        "user": reaction.user,
        "created_at": reaction.created_at,
    });
    let (target, comment_id) = match parent {
        ReactionParent::PullRequest(number) => {
            payload["pr_number"] = json!(number);
            (TargetRef::PullRequest(number), None)
        }
        ReactionParent::Issue(number) => {
            payload["issue_number"] = json!(number);
            (TargetRef::Issue(number), None)
        }
        ReactionParent::Comment { comment_id, parent } => {
            payload["comment_id"] = json!(comment_id);
            match parent {
                TargetRef::PullRequest(n) => payload["pr_number"] = json!(n),
                TargetRef::Issue(n) => payload["issue_number"] = json!(n),
                TargetRef::Discussion(n) => payload["discussion_number"] = json!(n),
            }
            (parent, Some(comment_id))
        }
    };

    let mut event = NewEvent::new(
        EventType::Reaction,
        user_actor(reaction.user.as_ref()),
        payload,
        reaction.created_at,
    )
    .with_target(target)
    .with_reaction(&reaction.content)
    .with_external_id(Some(reaction.id));
    event.comment_id = comment_id;
    event
}

fn discussion_reaction(
    reaction: &DiscussionReaction,
    number: i32,
    comment_id: Option<i64>,
) -> NewEvent {
    let content = rest_reaction_content(&reaction.content);
    let mut payload = json!({
        "id": reaction.database_id,
        "content": content,
        "user": reaction.user,
        "created_at": reaction.created_at,
        "discussion_number": number,
    });
    if let Some(comment_id) = comment_id {
        payload["comment_id"] = json!(comment_id);
    }

    let mut event = NewEvent::new(
        EventType::Reaction,
        author_actor(reaction.user.as_ref()),
        payload,
        reaction.created_at,
    )
    .with_target(TargetRef::Discussion(number))
    .with_reaction(content)
    .with_external_id(reaction.database_id);
    event.comment_id = comment_id;
    event
}

/// Expands a discussion into its canonical events: the discussion, then its
/// comments, then reactions on the discussion, then reactions on comments.
pub fn normalize_discussion(discussion: &Discussion) -> Vec<NewEvent> {
    let number = discussion.number;
    let mut events = Vec::with_capacity(
        1 + discussion.comments.len()
            + discussion.reactions.len()
            + discussion
                .comments
                .iter()
                .map(|c| c.reactions.len())
                .sum::<usize>(),
    );

    events.push(
        NewEvent::new(
            EventType::DiscussionCreated,
            author_actor(discussion.author.as_ref()),
            json!({
                "id": discussion.database_id,
                "number": number,
                "title": discussion.title,
                "author": discussion.author,
                "created_at": discussion.created_at,
            }),
            discussion.created_at,
        )
        .with_target(TargetRef::Discussion(number))
        .with_external_id(discussion.database_id),
    );

    for comment in &discussion.comments {
        let mut event = NewEvent::new(
            EventType::DiscussionComment,
            author_actor(comment.author.as_ref()),
            json!({
                "id": comment.database_id,
                "body": comment.body,
                "author": comment.author,
                "created_at": comment.created_at,
                "is_answer": comment.is_answer,
                "discussion_number": number,
            }),
            comment.created_at,
        )
        .with_target(TargetRef::Discussion(number))
        .with_external_id(comment.database_id);
        event.comment_id = comment.database_id;
        events.push(event);
    }

    events.extend(
        discussion
            .reactions
            .iter()
            .map(|reaction| discussion_reaction(reaction, number, None)),
    );

    for comment in &discussion.comments {
        events.extend(
            comment
                .reactions
                .iter()
                .map(|reaction| discussion_reaction(reaction, number, comment.database_id)),
        );
    }

    events
}

/// Batch-listed pull request, classified by state through the shared merge rule.
/// The payload mirrors the feed shape so both producers render alike.
pub fn normalize_listed_pull_request(pr: &PullRequestSummary) -> NewEvent {
    let event_type = classify_pull_request_state(&pr.state, pr.is_merged());
    let action = if pr.state == "closed" { "closed" } else { "opened" };
    NewEvent::new(
        event_type,
        user_actor(pr.user.as_ref()),
        json!({
            "action": action,
            "number": pr.number,
            "pull_request": pr,
        }),
        pr.created_at,
    )
    .with_target(TargetRef::PullRequest(pr.number))
    .with_external_id(Some(pr.id))
}

/// Batch-listed issue, keyed by the issue id like the feed's "opened" event.
pub fn normalize_listed_issue(issue: &IssueSummary) -> NewEvent {
    let action = if issue.state == "closed" { "closed" } else { "opened" };
    let event_type = classify_issue_action(action).unwrap_or(EventType::IssueOpened);
    NewEvent::new(
        event_type,
        user_actor(issue.user.as_ref()),
        json!({
            "action": action,
            "issue": issue,
        }),
        issue.created_at,
    )
    .with_target(TargetRef::Issue(issue.number))
    .with_external_id(Some(issue.id))
}

/// Batch-listed conversation comment under `parent`. Shaped like a feed
/// `created` comment so later edits and deletes find it by comment id.
pub fn normalize_listed_comment(comment: &IssueComment, parent: TargetRef, title: &str) -> NewEvent {
    NewEvent::new(
        EventType::IssueComment,
        user_actor(comment.user.as_ref()),
        json!({
            "action": "created",
            "issue": {"number": parent.number(), "title": title},
            "comment": {
                "id": comment.id,
                "body": comment.body,
                "user": comment.user,
                "created_at": comment.created_at,
                "updated_at": comment.updated_at,
            },
        }),
        comment.created_at,
    )
    .with_target(parent)
    .with_comment(comment.id)
    .with_external_id(Some(comment.id))
}

/// Stargazer listings have no star identifier; dedup relies on the fingerprint
/// and the one-star-per-actor rule.
pub fn normalize_stargazer(stargazer: &Stargazer) -> NewEvent {
    NewEvent::new(
        EventType::Star,
        user_actor(Some(&stargazer.user)),
        json!({
            "starred_at": stargazer.starred_at,
            "user": stargazer.user,
        }),
        stargazer.starred_at,
    )
}

/// Keyed by the fork repository id, the same key the feed's fork event uses.
pub fn normalize_fork(fork: &Fork) -> NewEvent {
    NewEvent::new(
        EventType::Fork,
        user_actor(fork.owner.as_ref()),
        json!({
            "forkee": {
                "id": fork.id,
                "full_name": fork.full_name,
                "owner": fork.owner,
                "created_at": fork.created_at,
            }
        }),
        fork.created_at,
    )
    .with_external_id(Some(fork.id))
}
