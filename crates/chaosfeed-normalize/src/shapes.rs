//! One strategy per feed payload shape.

use chaosfeed_core::{
    classify_issue_action, classify_pull_request_action, Actor, EventType, NewEvent, TargetRef,
};
use chaosfeed_github::{RawFeedEvent, UserRef};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::{decode_payload, Mutation, NormalizeError, Normalized, OpenItemChange, ShapeNormalizer};

pub(crate) fn all() -> Vec<Box<dyn ShapeNormalizer>> {
    vec![
        Box::new(PullRequestShape),
        Box::new(IssuesShape),
        Box::new(IssueCommentShape),
        Box::new(ReviewShape),
        Box::new(ReviewCommentShape),
        Box::new(CommitCommentShape),
        Box::new(PushShape),
        Box::new(WatchShape),
        Box::new(ForkShape),
        Box::new(CreateShape),
        Box::new(DeleteShape),
        Box::new(ReleaseShape),
        Box::new(GollumShape),
        Box::new(MemberShape),
        Box::new(DiscussionShape),
        Box::new(PublicShape),
    ]
}

fn actor_of(user: &UserRef) -> Actor {
    Actor::new(user.login.clone(), user.id)
}

/// Event attributed to the feed actor at the feed timestamp.
fn feed_event(raw: &RawFeedEvent, event_type: EventType) -> NewEvent {
    NewEvent::new(
        event_type,
        actor_of(&raw.actor),
        raw.payload.clone(),
        raw.created_at,
    )
}

#[derive(Deserialize)]
struct Comment {
    id: i64,
    #[serde(default)]
    user: UserRef,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
struct Changes {
    #[serde(default)]
    body: Option<ChangedBody>,
}

#[derive(Deserialize)]
struct ChangedBody {
    #[serde(default)]
    from: String,
}

/// Shared created/edited/deleted handling for comment-shaped payloads.
fn comment_outcome(
    raw: &RawFeedEvent,
    action: &str,
    comment: &Comment,
    changes: Option<&Changes>,
    event_type: EventType,
    target: Option<TargetRef>,
) -> Normalized {
    match action {
        "created" => {
            let mut event = NewEvent::new(
                event_type,
                actor_of(&comment.user),
                raw.payload.clone(),
                comment.created_at,
            )
            .with_comment(comment.id)
            .with_external_id(Some(comment.id));
            event.target = target;
            Normalized::event(event)
        }
        "edited" => {
            let previous = changes
                .and_then(|c| c.body.as_ref())
                .map(|body| body.from.as_str())
                .unwrap_or_default();
            if previous.is_empty() {
                debug!(comment_id = comment.id, "edit without a body change, skipping");
                return Normalized::empty();
            }
            Normalized::mutation(Mutation::EditComment {
                comment_id: comment.id,
                payload: raw.payload.clone(),
                previous_body: previous.to_string(),
                edited_at: raw.created_at,
            })
        }
        "deleted" => Normalized::mutation(Mutation::DeleteComment {
            comment_id: comment.id,
        }),
        _ => Normalized::empty(),
    }
}

struct PullRequestShape;

#[derive(Deserialize)]
struct PullRequestPayload {
    action: String,
    number: i32,
    pull_request: PullRequestObject,
}

#[derive(Deserialize)]
struct PullRequestObject {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    merged: Option<bool>,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
}

impl ShapeNormalizer for PullRequestShape {
    fn raw_type(&self) -> &'static str {
        "PullRequestEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: PullRequestPayload = decode_payload(self.raw_type(), raw)?;
        let pr = &payload.pull_request;
        let merged = pr.merged.unwrap_or(false) || pr.merged_at.is_some();
        let Some(event_type) = classify_pull_request_action(&payload.action, merged) else {
            return Ok(Normalized::empty());
        };

        // The opening row shares the pull request id with batch listings;
        // later transitions are distinct facts keyed by the feed id.
        let external_id = if event_type == EventType::PrOpened {
            Some(pr.id)
        } else {
            raw.numeric_id()
        };
        let event = feed_event(raw, event_type)
            .with_target(TargetRef::PullRequest(payload.number))
            .with_external_id(external_id);

        let outcome = Normalized::event(event);
        Ok(match payload.action.as_str() {
            "opened" | "reopened" => outcome.with_open_item(OpenItemChange::Opened {
                number: payload.number,
                title: pr.title.clone(),
            }),
            "closed" => outcome.with_open_item(OpenItemChange::Closed {
                number: payload.number,
            }),
            _ => outcome,
        })
    }
}

struct IssuesShape;

#[derive(Deserialize)]
struct IssuesPayload {
    action: String,
    issue: IssueObject,
}

#[derive(Deserialize)]
struct IssueObject {
    id: i64,
    number: i32,
}

impl ShapeNormalizer for IssuesShape {
    fn raw_type(&self) -> &'static str {
        "IssuesEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: IssuesPayload = decode_payload(self.raw_type(), raw)?;
        let Some(event_type) = classify_issue_action(&payload.action) else {
            return Ok(Normalized::empty());
        };
        let external_id = if event_type == EventType::IssueOpened {
            Some(payload.issue.id)
        } else {
            raw.numeric_id()
        };
        Ok(Normalized::event(
            feed_event(raw, event_type)
                .with_target(TargetRef::Issue(payload.issue.number))
                .with_external_id(external_id),
        ))
    }
}

struct IssueCommentShape;

#[derive(Deserialize)]
struct IssueCommentPayload {
    action: String,
    issue: CommentParent,
    comment: Comment,
    #[serde(default)]
    changes: Option<Changes>,
}

#[derive(Deserialize)]
struct CommentParent {
    number: i32,
    /// Present only when the parent issue is a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl ShapeNormalizer for IssueCommentShape {
    fn raw_type(&self) -> &'static str {
        "IssueCommentEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: IssueCommentPayload = decode_payload(self.raw_type(), raw)?;
        let target = if payload.issue.pull_request.is_some() {
            TargetRef::PullRequest(payload.issue.number)
        } else {
            TargetRef::Issue(payload.issue.number)
        };
        Ok(comment_outcome(
            raw,
            &payload.action,
            &payload.comment,
            payload.changes.as_ref(),
            EventType::IssueComment,
            Some(target),
        ))
    }
}

#[derive(Deserialize)]
struct PullNumber {
    number: i32,
}

struct ReviewShape;

#[derive(Deserialize)]
struct ReviewPayload {
    action: String,
    review: Review,
    pull_request: PullNumber,
}

#[derive(Deserialize)]
struct Review {
    id: i64,
    #[serde(default)]
    user: UserRef,
    #[serde(default)]
    submitted_at: Option<DateTime<Utc>>,
}

impl ShapeNormalizer for ReviewShape {
    fn raw_type(&self) -> &'static str {
        "PullRequestReviewEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: ReviewPayload = decode_payload(self.raw_type(), raw)?;
        let target = TargetRef::PullRequest(payload.pull_request.number);
        let event = match payload.action.as_str() {
            "submitted" => NewEvent::new(
                EventType::ReviewSubmitted,
                actor_of(&payload.review.user),
                raw.payload.clone(),
                payload.review.submitted_at.unwrap_or(raw.created_at),
            )
            .with_external_id(Some(payload.review.id)),
            "dismissed" => feed_event(raw, EventType::ReviewDismissed)
                .with_external_id(raw.numeric_id()),
            _ => return Ok(Normalized::empty()),
        };
        Ok(Normalized::event(event.with_target(target)))
    }
}

struct ReviewCommentShape;

#[derive(Deserialize)]
struct ReviewCommentPayload {
    action: String,
    comment: Comment,
    pull_request: PullNumber,
    #[serde(default)]
    changes: Option<Changes>,
}

impl ShapeNormalizer for ReviewCommentShape {
    fn raw_type(&self) -> &'static str {
        "PullRequestReviewCommentEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: ReviewCommentPayload = decode_payload(self.raw_type(), raw)?;
        Ok(comment_outcome(
            raw,
            &payload.action,
            &payload.comment,
            payload.changes.as_ref(),
            EventType::ReviewComment,
            Some(TargetRef::PullRequest(payload.pull_request.number)),
        ))
    }
}

struct CommitCommentShape;

#[derive(Deserialize)]
struct CommitCommentPayload {
    #[serde(default)]
    action: Option<String>,
    comment: Comment,
}

impl ShapeNormalizer for CommitCommentShape {
    fn raw_type(&self) -> &'static str {
        "CommitCommentEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: CommitCommentPayload = decode_payload(self.raw_type(), raw)?;
        let action = payload.action.as_deref().unwrap_or("created");
        Ok(comment_outcome(
            raw,
            action,
            &payload.comment,
            None,
            EventType::CommitComment,
            None,
        ))
    }
}

struct PushShape;

impl ShapeNormalizer for PushShape {
    fn raw_type(&self) -> &'static str {
        "PushEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        Ok(Normalized::event(
            feed_event(raw, EventType::Push).with_external_id(raw.numeric_id()),
        ))
    }
}

struct WatchShape;

impl ShapeNormalizer for WatchShape {
    fn raw_type(&self) -> &'static str {
        "WatchEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        Ok(Normalized::event(
            feed_event(raw, EventType::Star).with_external_id(raw.numeric_id()),
        ))
    }
}

struct ForkShape;

#[derive(Deserialize)]
struct ForkPayload {
    forkee: Forkee,
}

#[derive(Deserialize)]
struct Forkee {
    id: i64,
    created_at: DateTime<Utc>,
}

impl ShapeNormalizer for ForkShape {
    fn raw_type(&self) -> &'static str {
        "ForkEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: ForkPayload = decode_payload(self.raw_type(), raw)?;
        let mut event = feed_event(raw, EventType::Fork).with_external_id(Some(payload.forkee.id));
        event.occurred_at = payload.forkee.created_at;
        Ok(Normalized::event(event))
    }
}

#[derive(Deserialize)]
struct RefPayload {
    ref_type: String,
}

struct CreateShape;

impl ShapeNormalizer for CreateShape {
    fn raw_type(&self) -> &'static str {
        "CreateEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: RefPayload = decode_payload(self.raw_type(), raw)?;
        let event_type = match payload.ref_type.as_str() {
            "branch" => EventType::BranchCreated,
            "tag" => EventType::TagCreated,
            _ => return Ok(Normalized::empty()),
        };
        Ok(Normalized::event(
            feed_event(raw, event_type).with_external_id(raw.numeric_id()),
        ))
    }
}

struct DeleteShape;

impl ShapeNormalizer for DeleteShape {
    fn raw_type(&self) -> &'static str {
        "DeleteEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: RefPayload = decode_payload(self.raw_type(), raw)?;
        let event_type = match payload.ref_type.as_str() {
            "branch" => EventType::BranchDeleted,
            "tag" => EventType::TagDeleted,
            _ => return Ok(Normalized::empty()),
        };
        Ok(Normalized::event(
            feed_event(raw, event_type).with_external_id(raw.numeric_id()),
        ))
    }
}

struct ReleaseShape;

#[derive(Deserialize)]
struct ReleasePayload {
    action: String,
    release: Release,
}

#[derive(Deserialize)]
struct Release {
    id: i64,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

impl ShapeNormalizer for ReleaseShape {
    fn raw_type(&self) -> &'static str {
        "ReleaseEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: ReleasePayload = decode_payload(self.raw_type(), raw)?;
        if payload.action != "published" {
            return Ok(Normalized::empty());
        }
        let mut event =
            feed_event(raw, EventType::Release).with_external_id(Some(payload.release.id));
        event.occurred_at = payload.release.published_at.unwrap_or(raw.created_at);
        Ok(Normalized::event(event))
    }
}

struct GollumShape;

impl ShapeNormalizer for GollumShape {
    fn raw_type(&self) -> &'static str {
        "GollumEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        Ok(Normalized::event(
            feed_event(raw, EventType::WikiEdit).with_external_id(raw.numeric_id()),
        ))
    }
}

struct MemberShape;

#[derive(Deserialize)]
struct ActionOnly {
    action: String,
}

impl ShapeNormalizer for MemberShape {
    fn raw_type(&self) -> &'static str {
        "MemberEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: ActionOnly = decode_payload(self.raw_type(), raw)?;
        if payload.action != "added" {
            return Ok(Normalized::empty());
        }
        Ok(Normalized::event(
            feed_event(raw, EventType::CollaboratorAdded).with_external_id(raw.numeric_id()),
        ))
    }
}

struct DiscussionShape;

#[derive(Deserialize)]
struct DiscussionPayload {
    action: String,
    discussion: DiscussionObject,
}

#[derive(Deserialize)]
struct DiscussionObject {
    id: i64,
    number: i32,
    #[serde(default)]
    user: UserRef,
    created_at: DateTime<Utc>,
}

impl ShapeNormalizer for DiscussionShape {
    fn raw_type(&self) -> &'static str {
        "DiscussionEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        let payload: DiscussionPayload = decode_payload(self.raw_type(), raw)?;
        let discussion = &payload.discussion;
        let event = match payload.action.as_str() {
            "created" => NewEvent::new(
                EventType::DiscussionCreated,
                actor_of(&discussion.user),
                raw.payload.clone(),
                discussion.created_at,
            )
            .with_external_id(Some(discussion.id)),
            "answered" => feed_event(raw, EventType::DiscussionAnswered)
                .with_external_id(raw.numeric_id()),
            _ => return Ok(Normalized::empty()),
        };
        Ok(Normalized::event(
            event.with_target(TargetRef::Discussion(discussion.number)),
        ))
    }
}

struct PublicShape;

impl ShapeNormalizer for PublicShape {
    fn raw_type(&self) -> &'static str {
        "PublicEvent"
    }

    fn normalize(&self, raw: &RawFeedEvent) -> Result<Normalized, NormalizeError> {
        Ok(Normalized::event(
            feed_event(raw, EventType::RepoPublic).with_external_id(raw.numeric_id()),
        ))
    }
}
