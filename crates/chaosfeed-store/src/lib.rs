//! Postgres-backed event log.
//!
//! One append-mostly `events` table. Inserts are conditional so that every
//! producer can write the same fact without coordination: a row is skipped
//! when its external id is already stored, when an identical
//! `{type, actor, fingerprint, occurred_at}` row exists, or when the actor
//! already has a one-per-actor event (star, fork) of that type.

mod aggregates;
mod export;
mod query;

use std::time::Duration;

use chaosfeed_core::{
    Actor, EditHistoryEntry, Event, EventType, NewEvent, TargetRef, VoteChoice,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub use export::{ExportOptions, ExportSink, ExportStop, ExportSummary};
pub use query::{
    clamp_list_limit, ListFilters, SortOrder, DEFAULT_LIST_LIMIT, LOOKUP_LIMIT, MAX_LIST_LIMIT,
};

pub const CRATE_NAME: &str = "chaosfeed-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("undecodable row: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result of a conditional insert. A duplicate is an expected outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Stored {
        id: Uuid,
        ingested_at: DateTime<Utc>,
    },
    Duplicate,
}

impl InsertOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, InsertOutcome::Stored { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 25,
            min_connections: 5,
            max_lifetime: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl PoolSettings {
    fn options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .max_lifetime(self.max_lifetime)
            .idle_timeout(self.idle_timeout)
    }
}

pub(crate) const EVENT_COLUMNS: &str = "id, type, github_user, github_user_id, pr_number, \
     issue_number, discussion_number, comment_id, choice, reaction_type, github_id, payload, \
     content_hash, edit_history, occurred_at, ingested_at";

const INSERT_EVENT_SQL: &str = r#"
    WITH new_event AS (
        SELECT $1::varchar      AS type,
               $2::varchar      AS github_user,
               $3::bigint       AS github_user_id,
               $4::integer      AS pr_number,
               $5::integer      AS issue_number,
               $6::integer      AS discussion_number,
               $7::bigint       AS comment_id,
               $8::smallint     AS choice,
               $9::varchar      AS reaction_type,
               $10::bigint      AS github_id,
               $11::jsonb       AS payload,
               $12::varchar     AS content_hash,
               $13::timestamptz AS occurred_at
    )
    INSERT INTO events (
        type, github_user, github_user_id, pr_number, issue_number, discussion_number,
        comment_id, choice, reaction_type, github_id, payload, content_hash, occurred_at
    )
    SELECT n.type, n.github_user, n.github_user_id, n.pr_number, n.issue_number,
           n.discussion_number, n.comment_id, n.choice, n.reaction_type, n.github_id,
           n.payload, n.content_hash, n.occurred_at
      FROM new_event n
     WHERE NOT EXISTS (
               SELECT 1 FROM events e
                WHERE e.content_hash = n.content_hash
                  AND e.type = n.type
                  AND e.github_user = n.github_user
                  AND e.occurred_at = n.occurred_at
           )
       AND NOT (
               n.type = ANY($14)
               AND EXISTS (
                   SELECT 1 FROM events e
                    WHERE e.type = n.type
                      AND e.github_user = n.github_user
               )
           )
    ON CONFLICT (github_id) DO NOTHING
    RETURNING id, ingested_at
"#;

/// Shared handle over the connection pool. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with(url, &PoolSettings::default()).await
    }

    pub async fn connect_with(url: &str, settings: &PoolSettings) -> Result<Self, StoreError> {
        let pool = settings.options().connect(url).await?;
        info!(
            max_connections = settings.max_connections,
            min_connections = settings.min_connections,
            "connected to postgres"
        );
        Ok(Self { pool })
    }

    /// Builds the pool without opening a connection. Failures surface on first use.
    pub fn connect_lazy(url: &str) -> Result<Self, StoreError> {
        let pool = PoolSettings::default()
            .options()
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(2))
            .connect_lazy(url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn insert(&self, event: &NewEvent) -> Result<InsertOutcome, StoreError> {
        let one_per_actor: Vec<String> = EventType::ALL
            .into_iter()
            .filter(|t| t.is_one_per_actor())
            .map(|t| t.as_str().to_string())
            .collect();

        let row = sqlx::query(INSERT_EVENT_SQL)
            .bind(event.event_type.as_str())
            .bind(&event.actor.login)
            .bind(event.actor.id)
            .bind(event.pr_number())
            .bind(event.issue_number())
            .bind(event.discussion_number())
            .bind(event.comment_id)
            .bind(event.choice.map(VoteChoice::as_i16))
            .bind(event.reaction_kind.as_deref())
            .bind(event.external_id)
            .bind(&event.payload)
            .bind(event.content_hash())
            .bind(event.occurred_at)
            .bind(one_per_actor)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(InsertOutcome::Stored {
                id: row.try_get("id")?,
                ingested_at: row.try_get("ingested_at")?,
            }),
            None => {
                debug!(
                    event_type = %event.event_type,
                    github_user = %event.actor.login,
                    external_id = ?event.external_id,
                    "duplicate event skipped"
                );
                Ok(InsertOutcome::Duplicate)
            }
        }
    }

    /// Replaces the payload and fingerprint of the comment row and prepends
    /// the previous body to its edit history.
    pub async fn update_comment_edit(
        &self,
        comment_id: i64,
        payload: &serde_json::Value,
        previous_body: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let entry = vec![EditHistoryEntry {
            body: previous_body.to_string(),
            edited_at,
        }];
        let result = sqlx::query(
            r#"
            UPDATE events
               SET payload = $2,
                   content_hash = $3,
                   edit_history = $4::jsonb || edit_history
             WHERE comment_id = $1
               AND type = ANY($5)
            "#,
        )
        .bind(comment_id)
        .bind(payload)
        .bind(chaosfeed_core::payload_fingerprint(payload))
        .bind(Json(entry))
        .bind(comment_type_names())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("comment {comment_id}")));
        }
        Ok(())
    }

    pub async fn delete_by_comment_id(&self, comment_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE comment_id = $1 AND type = ANY($2)")
            .bind(comment_id)
            .bind(comment_type_names())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("comment {comment_id}")));
        }
        Ok(())
    }

    /// Keeps the earliest star and fork per actor. Returns rows removed.
    pub async fn deduplicate_stars_forks(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM events
             WHERE id IN (
                   SELECT id FROM (
                          SELECT id,
                                 ROW_NUMBER() OVER (
                                     PARTITION BY type, github_user
                                     ORDER BY occurred_at ASC, id ASC
                                 ) AS rn
                            FROM events
                           WHERE type IN ('star', 'fork')
                   ) ranked
                    WHERE rn > 1
             )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_types(&self, types: &[EventType]) -> Result<u64, StoreError> {
        if types.is_empty() {
            return Ok(0);
        }
        let names: Vec<String> = types.iter().map(|t| t.as_str().to_string()).collect();
        let result = sqlx::query("DELETE FROM events WHERE type = ANY($1)")
            .bind(names)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

pub(crate) fn decode_event_type(raw: &str) -> Result<EventType, StoreError> {
    raw.parse::<EventType>()
        .map_err(|err| StoreError::Decode(err.to_string()))
}

pub(crate) fn decode_choice(raw: Option<i16>) -> Result<Option<VoteChoice>, StoreError> {
    raw.map(|value| {
        VoteChoice::from_i16(value)
            .ok_or_else(|| StoreError::Decode(format!("invalid vote choice {value}")))
    })
    .transpose()
}

pub(crate) fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let type_name: String = row.try_get("type")?;
    let Json(edit_history): Json<Vec<EditHistoryEntry>> = row.try_get("edit_history")?;

    Ok(Event {
        id: row.try_get("id")?,
        event_type: decode_event_type(&type_name)?,
        actor: Actor::new(
            row.try_get::<String, _>("github_user")?,
            row.try_get::<i64, _>("github_user_id")?,
        ),
        target: TargetRef::from_columns(
            row.try_get("pr_number")?,
            row.try_get("issue_number")?,
            row.try_get("discussion_number")?,
        ),
        comment_id: row.try_get("comment_id")?,
        choice: decode_choice(row.try_get("choice")?)?,
        reaction_kind: row.try_get("reaction_type")?,
        external_id: row.try_get("github_id")?,
        payload: row.try_get("payload")?,
        content_hash: row.try_get("content_hash")?,
        edit_history,
        occurred_at: row.try_get("occurred_at")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

fn comment_type_names() -> Vec<&'static str> {
    EventType::COMMENTS.iter().map(|t| t.as_str()).collect()
}

pub(crate) fn events_from_rows(rows: &[PgRow]) -> Result<Vec<Event>, StoreError> {
    rows.iter().map(event_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_defaults_match_deployment_sizing() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_connections, 25);
        assert_eq!(settings.min_connections, 5);
        assert_eq!(settings.max_lifetime, Duration::from_secs(3600));
        assert_eq!(settings.idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn choice_column_decodes_only_unit_votes() {
        assert_eq!(decode_choice(None).unwrap(), None);
        assert_eq!(decode_choice(Some(1)).unwrap(), Some(VoteChoice::Up));
        assert_eq!(decode_choice(Some(-1)).unwrap(), Some(VoteChoice::Down));
        assert!(matches!(decode_choice(Some(3)), Err(StoreError::Decode(_))));
    }

    #[test]
    fn unknown_type_column_is_a_decode_error() {
        assert_eq!(decode_event_type("pr_merged").unwrap(), EventType::PrMerged);
        assert!(matches!(
            decode_event_type("sponsorship"),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn not_found_is_distinguishable() {
        assert!(StoreError::NotFound("comment 55".into()).is_not_found());
        assert!(!StoreError::Decode("x".into()).is_not_found());
    }

    #[test]
    fn one_per_actor_types_are_star_and_fork() {
        let names: Vec<&str> = EventType::ALL
            .into_iter()
            .filter(|t| t.is_one_per_actor())
            .map(EventType::as_str)
            .collect();
        assert_eq!(names, vec!["star", "fork"]);
    }

    #[test]
    fn comment_mutations_never_target_reactions() {
        let names = comment_type_names();
        assert_eq!(
            names,
            vec!["issue_comment", "review_comment", "commit_comment", "discussion_comment"]
        );
        assert!(!names.contains(&EventType::Reaction.as_str()));
    }

    #[tokio::test]
    async fn lazy_pool_does_not_connect_eagerly() {
        let store = PgEventStore::connect_lazy("postgres://nobody@127.0.0.1:1/none")
            .expect("lazy pool");
        assert!(store.health_check().await.is_err());
    }
}
