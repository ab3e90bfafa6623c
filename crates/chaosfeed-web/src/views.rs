//! Wire shapes. Events are flattened to one column per field so list
//! responses and export lines share a layout.

use std::collections::BTreeMap;

use chaosfeed_core::{EditHistoryEntry, Event, VoteDetail};
use chaosfeed_sync::LoopStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView<'a> {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub github_user: &'a str,
    pub github_user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discussion_number: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choice: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_id: Option<i64>,
    pub payload: &'a serde_json::Value,
    pub content_hash: &'a str,
    pub edit_history: &'a [EditHistoryEntry],
    pub occurred_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

impl<'a> From<&'a Event> for EventView<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            id: event.id,
            event_type: event.event_type.as_str(),
            github_user: &event.actor.login,
            github_user_id: event.actor.id,
            pr_number: event.pr_number(),
            issue_number: event.issue_number(),
            discussion_number: event.discussion_number(),
            comment_id: event.comment_id,
            choice: event.choice.map(|c| c.as_i16()),
            reaction_type: event.reaction_kind.as_deref(),
            github_id: event.external_id,
            payload: &event.payload,
            content_hash: &event.content_hash,
            edit_history: &event.edit_history,
            occurred_at: event.occurred_at,
            ingested_at: event.ingested_at,
        }
    }
}

pub fn event_views(events: &[Event]) -> Vec<EventView<'_>> {
    events.iter().map(EventView::from).collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<'a> {
    pub events: Vec<EventView<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Uuid>,
    pub total_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub services: BTreeMap<&'static str, &'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedHealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    pub events_last_hour: i64,
    pub ingesters: BTreeMap<&'static str, LoopStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrVoter {
    pub github_user: String,
    pub choice: i16,
    pub voted_at: DateTime<Utc>,
}

impl From<VoteDetail> for PrVoter {
    fn from(detail: VoteDetail) -> Self {
        Self {
            github_user: detail.github_user,
            choice: detail.choice.as_i16(),
            voted_at: detail.occurred_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrVotesResponse {
    pub pr_number: i32,
    pub upvotes: i64,
    pub downvotes: i64,
    pub net: i64,
    pub voters: Vec<PrVoter>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaosfeed_core::{Actor, EventType, TargetRef, VoteChoice};
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn vote_reaction_flattens_to_columns() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).unwrap();
        let event = Event {
            id: Uuid::nil(),
            event_type: EventType::Reaction,
            actor: Actor::new("bob", 2),
            target: Some(TargetRef::PullRequest(42)),
            comment_id: None,
            choice: Some(VoteChoice::Down),
            reaction_kind: Some("-1".into()),
            external_id: Some(701),
            payload: json!({"content": "-1"}),
            content_hash: "abc".into(),
            edit_history: Vec::new(),
            occurred_at: at,
            ingested_at: at,
        };

        let value = serde_json::to_value(EventView::from(&event)).unwrap();
        assert_eq!(value["type"], "reaction");
        assert_eq!(value["githubUser"], "bob");
        assert_eq!(value["prNumber"], 42);
        assert_eq!(value["choice"], -1);
        assert_eq!(value["reactionType"], "-1");
        assert_eq!(value["githubId"], 701);
        assert!(value.get("issueNumber").is_none());
        assert!(value.get("commentId").is_none());
        assert_eq!(value["editHistory"], json!([]));
    }
}
