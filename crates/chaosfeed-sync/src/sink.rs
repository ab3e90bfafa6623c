//! Write-side seams between producers and the event store.

use std::sync::Mutex;

use async_trait::async_trait;
use chaosfeed_core::{payload_fingerprint, EditHistoryEntry, Event, EventType, NewEvent, TargetRef};
use chaosfeed_store::{InsertOutcome, PgEventStore, StoreError};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// What the poll loops need from the store.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn insert(&self, event: &NewEvent) -> Result<InsertOutcome, StoreError>;

    async fn update_comment_edit(
        &self,
        comment_id: i64,
        payload: &serde_json::Value,
        previous_body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn delete_by_comment_id(&self, comment_id: i64) -> Result<(), StoreError>;
}

/// Extra maintenance the one-shot backfill performs.
#[async_trait]
pub trait BackfillStore: EventSink {
    async fn delete_by_types(&self, types: &[EventType]) -> Result<u64, StoreError>;

    async fn issue_comment_parents(&self) -> Result<Vec<(i64, TargetRef)>, StoreError>;

    async fn deduplicate_stars_forks(&self) -> Result<u64, StoreError>;
}

#[async_trait]
impl EventSink for PgEventStore {
    async fn insert(&self, event: &NewEvent) -> Result<InsertOutcome, StoreError> {
        PgEventStore::insert(self, event).await
    }

    async fn update_comment_edit(
        &self,
        comment_id: i64,
        payload: &serde_json::Value,
        previous_body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        PgEventStore::update_comment_edit(self, comment_id, payload, previous_body, edited_at).await
    }

    async fn delete_by_comment_id(&self, comment_id: i64) -> Result<(), StoreError> {
        PgEventStore::delete_by_comment_id(self, comment_id).await
    }
}

#[async_trait]
impl BackfillStore for PgEventStore {
    async fn delete_by_types(&self, types: &[EventType]) -> Result<u64, StoreError> {
        PgEventStore::delete_by_types(self, types).await
    }

    async fn issue_comment_parents(&self) -> Result<Vec<(i64, TargetRef)>, StoreError> {
        PgEventStore::issue_comment_parents(self).await
    }

    async fn deduplicate_stars_forks(&self) -> Result<u64, StoreError> {
        PgEventStore::deduplicate_stars_forks(self).await
    }
}

/// In-process sink with the same dedup rules as the Postgres store. Backs
/// dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
    failing: Mutex<bool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every insert fails with a store error.
    pub fn fail_inserts(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_of(&self, event_type: EventType) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_duplicate(stored: &[Event], event: &NewEvent, hash: &str) -> bool {
    stored.iter().any(|existing| {
        let same_external = event.external_id.is_some() && existing.external_id == event.external_id;
        let same_content = existing.content_hash == hash
            && existing.event_type == event.event_type
            && existing.actor.login == event.actor.login
            && existing.occurred_at == event.occurred_at;
        let one_per_actor = event.event_type.is_one_per_actor()
            && existing.event_type == event.event_type
            && existing.actor.login == event.actor.login;
        same_external || same_content || one_per_actor
    })
}

#[async_trait]
impl EventSink for MemorySink {
    async fn insert(&self, event: &NewEvent) -> Result<InsertOutcome, StoreError> {
        if *lock(&self.failing) {
            return Err(StoreError::Decode("memory sink set to fail".into()));
        }
        let hash = event.content_hash();
        let mut events = lock(&self.events);
        if is_duplicate(&events, event, &hash) {
            return Ok(InsertOutcome::Duplicate);
        }

        let id = Uuid::new_v4();
        let ingested_at = Utc::now();
        events.push(Event {
            id,
            event_type: event.event_type,
            actor: event.actor.clone(),
            target: event.target,
            comment_id: event.comment_id,
            choice: event.choice,
            reaction_kind: event.reaction_kind.clone(),
            external_id: event.external_id,
            payload: event.payload.clone(),
            content_hash: hash,
            edit_history: Vec::new(),
            occurred_at: event.occurred_at,
            ingested_at,
        });
        Ok(InsertOutcome::Stored { id, ingested_at })
    }

    async fn update_comment_edit(
        &self,
        comment_id: i64,
        payload: &serde_json::Value,
        previous_body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut events = lock(&self.events);
        let mut found = false;
        for event in events.iter_mut().filter(|e| is_comment_row(e, comment_id)) {
            event.payload = payload.clone();
            event.content_hash = payload_fingerprint(payload);
            event.edit_history.insert(
                0,
                EditHistoryEntry {
                    body: previous_body.to_string(),
                    edited_at,
                },
            );
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("comment {comment_id}")))
        }
    }

    async fn delete_by_comment_id(&self, comment_id: i64) -> Result<(), StoreError> {
        let mut events = lock(&self.events);
        let before = events.len();
        events.retain(|e| !is_comment_row(e, comment_id));
        if events.len() == before {
            return Err(StoreError::NotFound(format!("comment {comment_id}")));
        }
        Ok(())
    }
}

fn is_comment_row(event: &Event, comment_id: i64) -> bool {
    event.comment_id == Some(comment_id) && event.event_type.is_comment()
}

#[async_trait]
impl BackfillStore for MemorySink {
    async fn delete_by_types(&self, types: &[EventType]) -> Result<u64, StoreError> {
        let mut events = lock(&self.events);
        let before = events.len();
        events.retain(|e| !types.contains(&e.event_type));
        Ok((before - events.len()) as u64)
    }

    async fn issue_comment_parents(&self) -> Result<Vec<(i64, TargetRef)>, StoreError> {
        Ok(lock(&self.events)
            .iter()
            .filter(|e| e.event_type == EventType::IssueComment)
            .filter_map(|e| Some((e.comment_id?, e.target?)))
            .collect())
    }

    async fn deduplicate_stars_forks(&self) -> Result<u64, StoreError> {
        // Inserts already keep one per actor.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaosfeed_core::Actor;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, minute, 0).unwrap()
    }

    fn star(external_id: i64, marker: &str) -> NewEvent {
        NewEvent::new(
            EventType::Star,
            Actor::new("alice", 1),
            json!({"marker": marker}),
            at(external_id as u32 % 60),
        )
        .with_external_id(Some(external_id))
    }

    #[tokio::test]
    async fn second_star_for_same_actor_keeps_first_writer() {
        let sink = MemorySink::new();
        assert!(sink.insert(&star(100, "a")).await.unwrap().is_stored());
        assert_eq!(sink.insert(&star(200, "b")).await.unwrap(), InsertOutcome::Duplicate);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].external_id, Some(100));
    }

    #[tokio::test]
    async fn edit_then_delete_comment() {
        let sink = MemorySink::new();
        let comment = NewEvent::new(
            EventType::IssueComment,
            Actor::new("dave", 4),
            json!({"comment": {"id": 55, "body": "hello"}}),
            at(20),
        )
        .with_target(TargetRef::PullRequest(42))
        .with_comment(55);
        sink.insert(&comment).await.unwrap();

        let payload = json!({"comment": {"id": 55, "body": "hello world"}});
        sink.update_comment_edit(55, &payload, "hello", at(30)).await.unwrap();
        let stored = &sink.events()[0];
        assert_eq!(stored.payload["comment"]["body"], "hello world");
        assert_eq!(stored.edit_history[0].body, "hello");
        assert_eq!(
            sink.issue_comment_parents().await.unwrap(),
            vec![(55, TargetRef::PullRequest(42))]
        );

        sink.delete_by_comment_id(55).await.unwrap();
        assert!(sink.is_empty());
        assert!(sink.delete_by_comment_id(55).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn comment_edit_leaves_reactions_on_the_comment_unchanged() {
        let sink = MemorySink::new();
        let comment = NewEvent::new(
            EventType::IssueComment,
            Actor::new("dave", 4),
            json!({"comment": {"id": 55, "body": "hello"}}),
            at(20),
        )
        .with_target(TargetRef::Issue(7))
        .with_comment(55);
        let reaction = NewEvent::new(
            EventType::Reaction,
            Actor::new("erin", 5),
            json!({"id": 801, "content": "heart"}),
            at(21),
        )
        .with_target(TargetRef::Issue(7))
        .with_comment(55)
        .with_reaction("heart")
        .with_external_id(Some(801));
        sink.insert(&comment).await.unwrap();
        sink.insert(&reaction).await.unwrap();

        let payload = json!({"comment": {"id": 55, "body": "edited"}});
        sink.update_comment_edit(55, &payload, "hello", at(30)).await.unwrap();

        let events = sink.events();
        let stored = events
            .iter()
            .find(|e| e.event_type == EventType::Reaction)
            .unwrap();
        assert_eq!(stored.payload, json!({"id": 801, "content": "heart"}));
        assert!(stored.edit_history.is_empty());

        sink.delete_by_comment_id(55).await.unwrap();
        let left = sink.events();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].event_type, EventType::Reaction);
    }

    #[tokio::test]
    async fn failing_sink_reports_store_errors() {
        let sink = MemorySink::new();
        sink.fail_inserts(true);
        assert!(sink.insert(&star(1, "x")).await.is_err());
        sink.fail_inserts(false);
        assert!(sink.insert(&star(1, "x")).await.is_ok());
    }
}
