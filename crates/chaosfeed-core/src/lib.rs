//! Canonical event model for the repository activity feed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "chaosfeed-core";

/// Closed vocabulary of canonical event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PrOpened,
    PrClosed,
    PrMerged,
    PrReopened,
    PrEdited,
    PrSynchronized,
    ReviewSubmitted,
    ReviewComment,
    ReviewDismissed,
    IssueOpened,
    IssueClosed,
    IssueReopened,
    IssueEdited,
    IssueComment,
    CommitComment,
    DiscussionComment,
    Reaction,
    Star,
    Fork,
    Push,
    Release,
    BranchCreated,
    BranchDeleted,
    TagCreated,
    TagDeleted,
    DiscussionCreated,
    DiscussionAnswered,
    WikiEdit,
    CollaboratorAdded,
    /// Catch-all for low-value feed types (repository visibility changes).
    RepoPublic,
}

impl EventType {
    pub const ALL: [EventType; 30] = [
        EventType::PrOpened,
        EventType::PrClosed,
        EventType::PrMerged,
        EventType::PrReopened,
        EventType::PrEdited,
        EventType::PrSynchronized,
        EventType::ReviewSubmitted,
        EventType::ReviewComment,
        EventType::ReviewDismissed,
        EventType::IssueOpened,
        EventType::IssueClosed,
        EventType::IssueReopened,
        EventType::IssueEdited,
        EventType::IssueComment,
        EventType::CommitComment,
        EventType::DiscussionComment,
        EventType::Reaction,
        EventType::Star,
        EventType::Fork,
        EventType::Push,
        EventType::Release,
        EventType::BranchCreated,
        EventType::BranchDeleted,
        EventType::TagCreated,
        EventType::TagDeleted,
        EventType::DiscussionCreated,
        EventType::DiscussionAnswered,
        EventType::WikiEdit,
        EventType::CollaboratorAdded,
        EventType::RepoPublic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::PrOpened => "pr_opened",
            EventType::PrClosed => "pr_closed",
            EventType::PrMerged => "pr_merged",
            EventType::PrReopened => "pr_reopened",
            EventType::PrEdited => "pr_edited",
            EventType::PrSynchronized => "pr_synchronized",
            EventType::ReviewSubmitted => "review_submitted",
            EventType::ReviewComment => "review_comment",
            EventType::ReviewDismissed => "review_dismissed",
            EventType::IssueOpened => "issue_opened",
            EventType::IssueClosed => "issue_closed",
            EventType::IssueReopened => "issue_reopened",
            EventType::IssueEdited => "issue_edited",
            EventType::IssueComment => "issue_comment",
            EventType::CommitComment => "commit_comment",
            EventType::DiscussionComment => "discussion_comment",
            EventType::Reaction => "reaction",
            EventType::Star => "star",
            EventType::Fork => "fork",
            EventType::Push => "push",
            EventType::Release => "release",
            EventType::BranchCreated => "branch_created",
            EventType::BranchDeleted => "branch_deleted",
            EventType::TagCreated => "tag_created",
            EventType::TagDeleted => "tag_deleted",
            EventType::DiscussionCreated => "discussion_created",
            EventType::DiscussionAnswered => "discussion_answered",
            EventType::WikiEdit => "wiki_edit",
            EventType::CollaboratorAdded => "collaborator_added",
            EventType::RepoPublic => "repo_public",
        }
    }

    /// Stars and forks carry no identifier that is stable across producers,
    /// so the store keeps at most one per actor.
    pub fn is_one_per_actor(self) -> bool {
        matches!(self, EventType::Star | EventType::Fork)
    }

    /// Types whose rows are edited or deleted by comment id. Reactions on a
    /// comment share its id and are never touched by those mutations.
    pub const COMMENTS: [EventType; 4] = [
        EventType::IssueComment,
        EventType::ReviewComment,
        EventType::CommitComment,
        EventType::DiscussionComment,
    ];

    pub fn is_comment(self) -> bool {
        EventType::COMMENTS.contains(&self)
    }

    pub fn is_pull_request_lifecycle(self) -> bool {
        matches!(
            self,
            EventType::PrOpened
                | EventType::PrClosed
                | EventType::PrMerged
                | EventType::PrReopened
                | EventType::PrEdited
                | EventType::PrSynchronized
        )
    }

    pub fn is_issue_lifecycle(self) -> bool {
        matches!(
            self,
            EventType::IssueOpened
                | EventType::IssueClosed
                | EventType::IssueReopened
                | EventType::IssueEdited
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Shared merge rule: a closed pull request whose embedded object reports
/// `merged` is a merge. Every producer classifies lifecycle actions through
/// this function so live and batch rows agree.
pub fn classify_pull_request_action(action: &str, merged: bool) -> Option<EventType> {
    match action {
        "opened" => Some(EventType::PrOpened),
        "closed" if merged => Some(EventType::PrMerged),
        "closed" => Some(EventType::PrClosed),
        "reopened" => Some(EventType::PrReopened),
        "edited" => Some(EventType::PrEdited),
        "synchronize" => Some(EventType::PrSynchronized),
        _ => None,
    }
}

/// Classify a pull request listed by state (batch listings carry a state,
/// not an action). Routed through [`classify_pull_request_action`].
pub fn classify_pull_request_state(state: &str, merged: bool) -> EventType {
    let action = if state == "closed" { "closed" } else { "opened" };
    classify_pull_request_action(action, merged).unwrap_or(EventType::PrOpened)
}

pub fn classify_issue_action(action: &str) -> Option<EventType> {
    match action {
        "opened" => Some(EventType::IssueOpened),
        "closed" => Some(EventType::IssueClosed),
        "reopened" => Some(EventType::IssueReopened),
        "edited" => Some(EventType::IssueEdited),
        _ => None,
    }
}

/// Signed unit vote carried by `+1` / `-1` reactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum VoteChoice {
    Up,
    Down,
}

impl VoteChoice {
    pub fn from_reaction_content(content: &str) -> Option<Self> {
        match content {
            "+1" => Some(VoteChoice::Up),
            "-1" => Some(VoteChoice::Down),
            _ => None,
        }
    }

    pub fn as_i16(self) -> i16 {
        match self {
            VoteChoice::Up => 1,
            VoteChoice::Down => -1,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(VoteChoice::Up),
            -1 => Some(VoteChoice::Down),
            _ => None,
        }
    }
}

impl From<VoteChoice> for i8 {
    fn from(value: VoteChoice) -> Self {
        value.as_i16() as i8
    }
}

impl TryFrom<i8> for VoteChoice {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        VoteChoice::from_i16(i16::from(value)).ok_or_else(|| format!("invalid vote choice {value}"))
    }
}

/// The parent entity an event concerns. An event points at one parent or none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "number", rename_all = "snake_case")]
pub enum TargetRef {
    PullRequest(i32),
    Issue(i32),
    Discussion(i32),
}

impl TargetRef {
    /// Rebuild from the three nullable storage columns. The first populated
    /// column wins.
    pub fn from_columns(pr: Option<i32>, issue: Option<i32>, discussion: Option<i32>) -> Option<Self> {
        pr.map(TargetRef::PullRequest)
            .or(issue.map(TargetRef::Issue))
            .or(discussion.map(TargetRef::Discussion))
    }

    pub fn number(self) -> i32 {
        match self {
            TargetRef::PullRequest(n) | TargetRef::Issue(n) | TargetRef::Discussion(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub login: String,
    /// Zero when the source omits it.
    pub id: i64,
}

impl Actor {
    pub fn new(login: impl Into<String>, id: i64) -> Self {
        Self {
            login: login.into(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditHistoryEntry {
    pub body: String,
    pub edited_at: DateTime<Utc>,
}

pub fn content_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Fingerprint of a structured payload. Object keys serialize in sorted
/// order, so equal documents hash equally.
pub fn payload_fingerprint(payload: &serde_json::Value) -> String {
    content_fingerprint(&serde_json::to_vec(payload).unwrap_or_default())
}

/// A canonical event before the store has assigned it an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub actor: Actor,
    pub target: Option<TargetRef>,
    pub comment_id: Option<i64>,
    pub choice: Option<VoteChoice>,
    pub reaction_kind: Option<String>,
    pub external_id: Option<i64>,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn new(
        event_type: EventType,
        actor: Actor,
        payload: serde_json::Value,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            actor,
            target: None,
            comment_id: None,
            choice: None,
            reaction_kind: None,
            external_id: None,
            payload,
            occurred_at,
        }
    }

    pub fn with_target(mut self, target: TargetRef) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_comment(mut self, comment_id: i64) -> Self {
        self.comment_id = Some(comment_id);
        self
    }

    pub fn with_external_id(mut self, external_id: Option<i64>) -> Self {
        self.external_id = external_id;
        self
    }

    /// Record a reaction's content. Only `+1`/`-1` become a vote choice.
    pub fn with_reaction(mut self, content: &str) -> Self {
        self.choice = VoteChoice::from_reaction_content(content);
        self.reaction_kind = Some(content.to_string());
        self
    }

    pub fn content_hash(&self) -> String {
        payload_fingerprint(&self.payload)
    }

    pub fn pr_number(&self) -> Option<i32> {
        match self.target {
            Some(TargetRef::PullRequest(n)) => Some(n),
            _ => None,
        }
    }

    pub fn issue_number(&self) -> Option<i32> {
        match self.target {
            Some(TargetRef::Issue(n)) => Some(n),
            _ => None,
        }
    }

    pub fn discussion_number(&self) -> Option<i32> {
        match self.target {
            Some(TargetRef::Discussion(n)) => Some(n),
            _ => None,
        }
    }
}

/// A stored canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub actor: Actor,
    pub target: Option<TargetRef>,
    pub comment_id: Option<i64>,
    pub choice: Option<VoteChoice>,
    pub reaction_kind: Option<String>,
    pub external_id: Option<i64>,
    pub payload: serde_json::Value,
    pub content_hash: String,
    pub edit_history: Vec<EditHistoryEntry>,
    pub occurred_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

impl Event {
    pub fn pr_number(&self) -> Option<i32> {
        match self.target {
            Some(TargetRef::PullRequest(n)) => Some(n),
            _ => None,
        }
    }

    pub fn issue_number(&self) -> Option<i32> {
        match self.target {
            Some(TargetRef::Issue(n)) => Some(n),
            _ => None,
        }
    }

    pub fn discussion_number(&self) -> Option<i32> {
        match self.target {
            Some(TargetRef::Discussion(n)) => Some(n),
            _ => None,
        }
    }
}

/// Aggregated voting behaviour of one actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterSummary {
    pub github_user: String,
    pub github_user_id: i64,
    pub total_votes: i64,
    pub upvotes: i64,
    pub downvotes: i64,
    pub first_vote: DateTime<Utc>,
    pub last_vote: DateTime<Utc>,
    pub prs_voted_on: Vec<i32>,
    pub unique_prs: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteDetail {
    pub github_user: String,
    pub github_user_id: i64,
    pub choice: VoteChoice,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub upvotes: i64,
    pub downvotes: i64,
}

impl VoteTally {
    pub fn net(&self) -> i64 {
        self.upvotes - self.downvotes
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStats {
    pub total_events: i64,
    pub total_votes: i64,
    pub total_voters: i64,
    pub latest_event_at: Option<DateTime<Utc>>,
    pub events_last_hour: i64,
    pub events_by_type: BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(
            content_fingerprint(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn payload_fingerprint_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(payload_fingerprint(&a), payload_fingerprint(&b));
        assert_ne!(payload_fingerprint(&a), payload_fingerprint(&json!({"b": 2})));
    }

    #[test]
    fn closed_and_merged_pull_request_is_a_merge() {
        assert_eq!(
            classify_pull_request_action("closed", true),
            Some(EventType::PrMerged)
        );
        assert_eq!(
            classify_pull_request_action("closed", false),
            Some(EventType::PrClosed)
        );
        assert_eq!(
            classify_pull_request_action("synchronize", false),
            Some(EventType::PrSynchronized)
        );
        assert_eq!(classify_pull_request_action("labeled", false), None);
    }

    #[test]
    fn listing_state_uses_the_same_merge_rule() {
        assert_eq!(classify_pull_request_state("closed", true), EventType::PrMerged);
        assert_eq!(classify_pull_request_state("closed", false), EventType::PrClosed);
        assert_eq!(classify_pull_request_state("open", false), EventType::PrOpened);
    }

    #[test]
    fn only_thumbs_become_votes() {
        let up = NewEvent::new(EventType::Reaction, Actor::new("alice", 1), json!({}), ts())
            .with_reaction("+1");
        assert_eq!(up.choice, Some(VoteChoice::Up));
        assert_eq!(up.reaction_kind.as_deref(), Some("+1"));

        let heart = NewEvent::new(EventType::Reaction, Actor::new("bob", 2), json!({}), ts())
            .with_reaction("heart");
        assert_eq!(heart.choice, None);
        assert_eq!(heart.reaction_kind.as_deref(), Some("heart"));
    }

    #[test]
    fn event_type_names_parse_back() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
            assert_eq!(
                serde_json::to_value(t).unwrap(),
                serde_json::Value::String(t.as_str().to_string())
            );
        }
        assert!("pr_exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn target_accessors_are_exclusive() {
        let event = NewEvent::new(EventType::IssueComment, Actor::new("carol", 3), json!({}), ts())
            .with_target(TargetRef::Issue(12));
        assert_eq!(event.issue_number(), Some(12));
        assert_eq!(event.pr_number(), None);
        assert_eq!(event.discussion_number(), None);
        assert_eq!(
            serde_json::to_value(event.target).unwrap(),
            json!({"kind": "issue", "number": 12})
        );
    }

    #[test]
    fn vote_choice_serializes_as_signed_unit() {
        assert_eq!(serde_json::to_value(VoteChoice::Down).unwrap(), json!(-1));
        let parsed: VoteChoice = serde_json::from_value(json!(1)).unwrap();
        assert_eq!(parsed, VoteChoice::Up);
        assert!(serde_json::from_value::<VoteChoice>(json!(0)).is_err());
    }
}
