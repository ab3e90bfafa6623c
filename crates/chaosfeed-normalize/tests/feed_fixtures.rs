use std::path::{Path, PathBuf};

use anyhow::Context;
use chaosfeed_core::{EventType, TargetRef};
use chaosfeed_github::RawFeedEvent;
use chaosfeed_normalize::{Mutation, Normalized, Normalizer, OpenItemChange};

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/events")
        .join(name)
}

fn load(name: &str) -> anyhow::Result<RawFeedEvent> {
    let path = fixture_path(name);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing fixture {}", path.display()))
}

fn normalize(name: &str) -> Normalized {
    let raw = load(name).expect("fixture");
    Normalizer::standard().normalize(&raw).expect("normalize")
}

#[test]
fn closed_pull_request_with_merged_flag_is_a_merge() {
    let outcome = normalize("pull_request_closed_merged.json");
    assert_eq!(outcome.events.len(), 1);
    let event = &outcome.events[0];
    assert_eq!(event.event_type, EventType::PrMerged);
    assert_eq!(event.target, Some(TargetRef::PullRequest(42)));
    assert_eq!(event.external_id, Some(48213377001));
    assert_eq!(event.actor.login, "alice");
    assert_eq!(outcome.open_item, Some(OpenItemChange::Closed { number: 42 }));
}

#[test]
fn closed_pull_request_without_merge_stays_closed() {
    let outcome = normalize("pull_request_closed_unmerged.json");
    assert_eq!(outcome.events[0].event_type, EventType::PrClosed);
}

#[test]
fn opened_pull_request_is_keyed_by_pull_request_id_and_tracked() {
    let outcome = normalize("pull_request_opened.json");
    let event = &outcome.events[0];
    assert_eq!(event.event_type, EventType::PrOpened);
    assert_eq!(event.external_id, Some(2600000044));
    assert_eq!(
        outcome.open_item,
        Some(OpenItemChange::Opened {
            number: 44,
            title: Some("Vote on everything".to_string())
        })
    );
}

#[test]
fn comment_parent_resolves_to_pull_request_or_issue() {
    let on_pr = normalize("issue_comment_created_on_pr.json");
    let event = &on_pr.events[0];
    assert_eq!(event.event_type, EventType::IssueComment);
    assert_eq!(event.pr_number(), Some(42));
    assert_eq!(event.issue_number(), None);
    assert_eq!(event.comment_id, Some(55));
    assert_eq!(event.actor.login, "dave");
    assert_eq!(event.occurred_at.to_rfc3339(), "2026-02-24T12:20:00+00:00");

    let on_issue = normalize("issue_comment_created_on_issue.json");
    let event = &on_issue.events[0];
    assert_eq!(event.issue_number(), Some(7));
    assert_eq!(event.pr_number(), None);
}

#[test]
fn comment_edit_becomes_a_mutation_with_previous_body() {
    let outcome = normalize("issue_comment_edited.json");
    assert!(outcome.events.is_empty());
    match outcome.mutation {
        Some(Mutation::EditComment {
            comment_id,
            payload,
            previous_body,
            edited_at,
        }) => {
            assert_eq!(comment_id, 55);
            assert_eq!(previous_body, "hello");
            assert_eq!(payload["comment"]["body"], "hello world");
            assert_eq!(edited_at.to_rfc3339(), "2026-02-24T12:30:00+00:00");
        }
        other => panic!("expected edit mutation, got {other:?}"),
    }
}

#[test]
fn comment_delete_becomes_a_mutation() {
    let outcome = normalize("issue_comment_deleted.json");
    assert!(outcome.events.is_empty());
    assert_eq!(
        outcome.mutation,
        Some(Mutation::DeleteComment { comment_id: 56 })
    );
}

#[test]
fn missing_feed_id_yields_null_external_id() {
    let outcome = normalize("watch_without_id.json");
    let event = &outcome.events[0];
    assert_eq!(event.event_type, EventType::Star);
    assert_eq!(event.external_id, None);
    assert!(!event.content_hash().is_empty());
}

#[test]
fn fork_uses_fork_repository_id_and_time() {
    let outcome = normalize("fork.json");
    let event = &outcome.events[0];
    assert_eq!(event.event_type, EventType::Fork);
    assert_eq!(event.external_id, Some(777000111));
    assert_eq!(event.occurred_at.to_rfc3339(), "2026-02-24T12:55:00+00:00");
}

#[test]
fn push_and_visibility_events_reuse_feed_id() {
    let push = normalize("push.json");
    assert_eq!(push.events[0].event_type, EventType::Push);
    assert_eq!(push.events[0].external_id, Some(48213377030));

    let public = normalize("public.json");
    assert_eq!(public.events[0].event_type, EventType::RepoPublic);
    assert_eq!(public.events[0].event_type.as_str(), "repo_public");
}

#[test]
fn identical_fixture_normalizes_to_identical_fingerprint() {
    let first = normalize("push.json");
    let second = normalize("push.json");
    assert_eq!(
        first.events[0].content_hash(),
        second.events[0].content_hash()
    );
}
