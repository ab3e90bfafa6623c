use std::str::FromStr;

use chaosfeed_core::{Event, EventType, TargetRef};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::{event_from_row, events_from_rows, PgEventStore, StoreError, EVENT_COLUMNS};

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 100;
/// Cap for the per-parent and per-actor lookups.
pub const LOOKUP_LIMIT: i64 = 500;

/// Chronological direction over `(occurred_at, id)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

impl SortOrder {
    fn cursor_comparison(self) -> &'static str {
        match self {
            SortOrder::Newest => "<",
            SortOrder::Oldest => ">",
        }
    }

    fn order_by(self) -> &'static str {
        match self {
            SortOrder::Newest => " ORDER BY occurred_at DESC, id DESC",
            SortOrder::Oldest => " ORDER BY occurred_at ASC, id ASC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" | "desc" => Ok(SortOrder::Newest),
            "oldest" | "asc" => Ok(SortOrder::Oldest),
            other => Err(format!("unknown sort order {other:?}")),
        }
    }
}

/// Conjunctive filters shared by list, count and export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilters {
    pub types: Vec<EventType>,
    pub pr_number: Option<i32>,
    pub issue_number: Option<i32>,
    pub discussion_number: Option<i32>,
    pub github_user: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Hide reactions whose parent is a comment.
    pub exclude_comment_reactions: bool,
}

impl ListFilters {
    fn push_predicates(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if !self.types.is_empty() {
            let names: Vec<String> = self.types.iter().map(|t| t.as_str().to_string()).collect();
            builder.push(" AND type = ANY(").push_bind(names).push(")");
        }
        if let Some(pr_number) = self.pr_number {
            builder.push(" AND pr_number = ").push_bind(pr_number);
        }
        if let Some(issue_number) = self.issue_number {
            builder.push(" AND issue_number = ").push_bind(issue_number);
        }
        if let Some(discussion_number) = self.discussion_number {
            builder.push(" AND discussion_number = ").push_bind(discussion_number);
        }
        if let Some(user) = &self.github_user {
            builder.push(" AND github_user = ").push_bind(user.clone());
        }
        if let Some(since) = self.since {
            builder.push(" AND occurred_at >= ").push_bind(since);
        }
        if let Some(until) = self.until {
            builder.push(" AND occurred_at <= ").push_bind(until);
        }
        if self.exclude_comment_reactions {
            builder.push(" AND NOT (type = 'reaction' AND comment_id IS NOT NULL)");
        }
    }
}

/// Keyset page over `(occurred_at, id)`. The cursor row's own position is
/// looked up in the same statement, so a deleted cursor matches nothing.
fn page_query(
    filters: &ListFilters,
    sort: SortOrder,
    limit: i64,
    cursor: Option<Uuid>,
) -> QueryBuilder<'static, Postgres> {
    let mut builder =
        QueryBuilder::<Postgres>::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE TRUE"));
    filters.push_predicates(&mut builder);
    if let Some(cursor) = cursor {
        builder
            .push(" AND (occurred_at, id) ")
            .push(sort.cursor_comparison())
            .push(" (SELECT occurred_at, id FROM events WHERE id = ")
            .push_bind(cursor)
            .push(")");
    }
    builder.push(sort.order_by());
    builder.push(" LIMIT ").push_bind(limit);
    builder
}

/// Out-of-range limits fall back to the default.
pub fn clamp_list_limit(limit: i64) -> i64 {
    if limit <= 0 || limit > MAX_LIST_LIMIT {
        DEFAULT_LIST_LIMIT
    } else {
        limit
    }
}

impl PgEventStore {
    /// One page of events after `cursor`, the id of the last row of the
    /// previous page. A cursor naming a row that no longer exists yields an
    /// empty page.
    pub async fn list(
        &self,
        filters: &ListFilters,
        sort: SortOrder,
        limit: i64,
        cursor: Option<Uuid>,
    ) -> Result<Vec<Event>, StoreError> {
        self.page(filters, sort, clamp_list_limit(limit), cursor).await
    }

    /// Export variant of [`list`](Self::list) with a caller-chosen page size.
    pub async fn export_page(
        &self,
        filters: &ListFilters,
        sort: SortOrder,
        page_size: i64,
        cursor: Option<Uuid>,
    ) -> Result<Vec<Event>, StoreError> {
        self.page(filters, sort, page_size.max(1), cursor).await
    }

    async fn page(
        &self,
        filters: &ListFilters,
        sort: SortOrder,
        limit: i64,
        cursor: Option<Uuid>,
    ) -> Result<Vec<Event>, StoreError> {
        let mut builder = page_query(filters, sort, limit, cursor);
        let rows = builder.build().fetch_all(self.pool()).await?;
        events_from_rows(&rows)
    }

    pub async fn count(&self, filters: &ListFilters) -> Result<i64, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM events WHERE TRUE");
        filters.push_predicates(&mut builder);
        let row = builder.build().fetch_one(self.pool()).await?;
        Ok(row.try_get("total")?)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Event, StoreError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("event {id}")))?;
        event_from_row(&row)
    }

    pub async fn get_by_pr(&self, pr_number: i32) -> Result<Vec<Event>, StoreError> {
        self.lookup("pr_number = $1", pr_number).await
    }

    pub async fn get_by_issue(&self, issue_number: i32) -> Result<Vec<Event>, StoreError> {
        self.lookup("issue_number = $1", issue_number).await
    }

    pub async fn get_by_user(&self, github_user: &str) -> Result<Vec<Event>, StoreError> {
        self.lookup("github_user = $1", github_user.to_string()).await
    }

    async fn lookup<T>(&self, predicate: &str, value: T) -> Result<Vec<Event>, StoreError>
    where
        T: for<'q> sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres> + Send + 'static,
    {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE {predicate} \
             ORDER BY occurred_at DESC, id DESC LIMIT {LOOKUP_LIMIT}"
        );
        let rows = sqlx::query(&sql).bind(value).fetch_all(self.pool()).await?;
        events_from_rows(&rows)
    }

    /// Stored issue comments with their parent, used to walk comment reactions.
    pub async fn issue_comment_parents(&self) -> Result<Vec<(i64, TargetRef)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT comment_id, pr_number, issue_number
              FROM events
             WHERE type = 'issue_comment'
               AND comment_id IS NOT NULL
             ORDER BY occurred_at ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let comment_id: i64 = row.try_get("comment_id")?;
            if let Some(parent) =
                TargetRef::from_columns(row.try_get("pr_number")?, row.try_get("issue_number")?, None)
            {
                out.push((comment_id, parent));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_for(filters: &ListFilters) -> String {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 FROM events WHERE TRUE");
        filters.push_predicates(&mut builder);
        builder.sql().to_string()
    }

    #[test]
    fn limits_outside_range_use_default() {
        assert_eq!(clamp_list_limit(0), 50);
        assert_eq!(clamp_list_limit(-5), 50);
        assert_eq!(clamp_list_limit(101), 50);
        assert_eq!(clamp_list_limit(100), 100);
        assert_eq!(clamp_list_limit(7), 7);
    }

    #[test]
    fn sort_order_parses_aliases() {
        assert_eq!("newest".parse::<SortOrder>().unwrap(), SortOrder::Newest);
        assert_eq!("oldest".parse::<SortOrder>().unwrap(), SortOrder::Oldest);
        assert_eq!("asc".parse::<SortOrder>().unwrap(), SortOrder::Oldest);
        assert!("sideways".parse::<SortOrder>().is_err());
        assert_eq!(SortOrder::default(), SortOrder::Newest);
    }

    #[test]
    fn empty_filters_add_no_predicates() {
        assert_eq!(sql_for(&ListFilters::default()), "SELECT 1 FROM events WHERE TRUE");
    }

    #[test]
    fn filters_are_conjunctive_and_bound() {
        let filters = ListFilters {
            types: vec![EventType::Reaction, EventType::Star],
            pr_number: Some(42),
            github_user: Some("alice".into()),
            since: Some(Utc::now()),
            until: None,
            exclude_comment_reactions: true,
            ..ListFilters::default()
        };
        let sql = sql_for(&filters);
        assert!(sql.contains("type = ANY($1)"));
        assert!(sql.contains("pr_number = $2"));
        assert!(sql.contains("github_user = $3"));
        assert!(sql.contains("occurred_at >= $4"));
        assert!(!sql.contains("occurred_at <="));
        assert!(sql.contains("NOT (type = 'reaction' AND comment_id IS NOT NULL)"));
    }

    #[test]
    fn issue_and_discussion_parents_filter_their_own_columns() {
        let filters = ListFilters {
            issue_number: Some(8),
            discussion_number: Some(12),
            ..ListFilters::default()
        };
        assert_eq!(
            sql_for(&filters),
            "SELECT 1 FROM events WHERE TRUE AND issue_number = $1 AND discussion_number = $2"
        );

        let only_issue = ListFilters {
            issue_number: Some(8),
            ..ListFilters::default()
        };
        let sql = sql_for(&only_issue);
        assert!(sql.ends_with("AND issue_number = $1"));
        assert!(!sql.contains("pr_number"));
        assert!(!sql.contains("discussion_number"));
    }

    #[test]
    fn cursor_pages_compare_the_full_sort_key_after_filters() {
        let cursor = Uuid::nil();
        let filters = ListFilters {
            pr_number: Some(42),
            ..ListFilters::default()
        };
        let newest = page_query(&filters, SortOrder::Newest, 20, Some(cursor));
        let sql = newest.sql();
        let filter_at = sql.find("pr_number = $1").expect("filter");
        let cursor_at = sql
            .find("AND (occurred_at, id) < (SELECT occurred_at, id FROM events WHERE id = $2)")
            .expect("cursor predicate");
        assert!(filter_at < cursor_at);
        assert!(sql.ends_with(" ORDER BY occurred_at DESC, id DESC LIMIT $3"));

        let oldest = page_query(&ListFilters::default(), SortOrder::Oldest, 20, Some(cursor));
        assert!(oldest.sql().contains("(occurred_at, id) > (SELECT"));

        let first_page = page_query(&ListFilters::default(), SortOrder::Newest, 20, None);
        assert!(!first_page.sql().contains("(occurred_at, id)"));
        assert!(first_page.sql().ends_with("LIMIT $1"));
    }

    #[test]
    fn cursor_comparison_follows_direction() {
        assert_eq!(SortOrder::Newest.cursor_comparison(), "<");
        assert_eq!(SortOrder::Oldest.cursor_comparison(), ">");
        assert!(SortOrder::Oldest.order_by().contains("occurred_at ASC, id ASC"));
        assert!(SortOrder::Newest.order_by().contains("occurred_at DESC, id DESC"));
    }
}
