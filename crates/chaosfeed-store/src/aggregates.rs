//! Read-side projections. Votes are `reaction` rows with a choice whose
//! parent is the item itself; reactions on comments never count.

use std::collections::{BTreeMap, HashMap};

use chaosfeed_core::{FeedStats, VoteDetail, VoteTally, VoterSummary};
use sqlx::postgres::PgRow;
use sqlx::Row;

use crate::{decode_choice, PgEventStore, StoreError};

const VOTE_PREDICATE: &str = "type = 'reaction' AND choice IS NOT NULL AND comment_id IS NULL";

fn voter_query(extra: &str) -> String {
    format!(
        r#"
        SELECT github_user,
               github_user_id,
               COUNT(*) AS total_votes,
               COUNT(*) FILTER (WHERE choice = 1) AS upvotes,
               COUNT(*) FILTER (WHERE choice = -1) AS downvotes,
               MIN(occurred_at) AS first_vote,
               MAX(occurred_at) AS last_vote,
               array_agg(DISTINCT pr_number ORDER BY pr_number)
                   FILTER (WHERE pr_number IS NOT NULL) AS prs_voted_on
          FROM events
         WHERE {VOTE_PREDICATE}{extra}
         GROUP BY github_user, github_user_id
         ORDER BY total_votes DESC, github_user ASC
        "#
    )
}

fn tally_query() -> String {
    format!(
        r#"
        SELECT COUNT(*) FILTER (WHERE choice = 1) AS upvotes,
               COUNT(*) FILTER (WHERE choice = -1) AS downvotes
          FROM events
         WHERE {VOTE_PREDICATE} AND pr_number = $1
        "#
    )
}

// Only the voter and vote totals are restricted to votes; the rest count every row.
fn stats_query() -> String {
    format!(
        r#"
        SELECT COUNT(*) AS total_events,
               COUNT(*) FILTER (WHERE {VOTE_PREDICATE}) AS total_votes,
               COUNT(DISTINCT github_user) FILTER (WHERE {VOTE_PREDICATE}) AS total_voters,
               MAX(occurred_at) AS latest_event_at,
               COUNT(*) FILTER (WHERE occurred_at > NOW() - INTERVAL '1 hour') AS events_last_hour
          FROM events
        "#
    )
}

fn voter_from_row(row: &PgRow) -> Result<VoterSummary, StoreError> {
    let prs_voted_on: Vec<i32> = row
        .try_get::<Option<Vec<i32>>, _>("prs_voted_on")?
        .unwrap_or_default();
    Ok(VoterSummary {
        github_user: row.try_get("github_user")?,
        github_user_id: row.try_get("github_user_id")?,
        total_votes: row.try_get("total_votes")?,
        upvotes: row.try_get("upvotes")?,
        downvotes: row.try_get("downvotes")?,
        first_vote: row.try_get("first_vote")?,
        last_vote: row.try_get("last_vote")?,
        unique_prs: prs_voted_on.len(),
        prs_voted_on,
    })
}

impl PgEventStore {
    /// Voter leaderboard, most votes first.
    pub async fn voters(&self) -> Result<Vec<VoterSummary>, StoreError> {
        let rows = sqlx::query(&voter_query(""))
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(voter_from_row).collect()
    }

    pub async fn voter(&self, github_user: &str) -> Result<VoterSummary, StoreError> {
        let row = sqlx::query(&voter_query(" AND github_user = $1"))
            .bind(github_user)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("voter {github_user}")))?;
        voter_from_row(&row)
    }

    pub async fn pr_votes(&self, pr_number: i32) -> Result<VoteTally, StoreError> {
        let row = sqlx::query(&tally_query())
            .bind(pr_number)
            .fetch_one(self.pool())
            .await?;

        Ok(VoteTally {
            upvotes: row.try_get("upvotes")?,
            downvotes: row.try_get("downvotes")?,
        })
    }

    /// Individual votes on a pull request, oldest first.
    pub async fn pr_vote_details(&self, pr_number: i32) -> Result<Vec<VoteDetail>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT github_user, github_user_id, choice, occurred_at
              FROM events
             WHERE {VOTE_PREDICATE} AND pr_number = $1
             ORDER BY occurred_at ASC, id ASC
            "#
        ))
        .bind(pr_number)
        .fetch_all(self.pool())
        .await?;

        let mut details = Vec::with_capacity(rows.len());
        for row in rows {
            let choice = decode_choice(row.try_get("choice")?)?
                .ok_or_else(|| StoreError::Decode("vote row without choice".into()))?;
            details.push(VoteDetail {
                github_user: row.try_get("github_user")?,
                github_user_id: row.try_get("github_user_id")?,
                choice,
                occurred_at: row.try_get("occurred_at")?,
            });
        }
        Ok(details)
    }

    pub async fn stats(&self) -> Result<FeedStats, StoreError> {
        let row = sqlx::query(&stats_query())
            .fetch_one(self.pool())
            .await?;

        let type_rows = sqlx::query("SELECT type, COUNT(*) AS count FROM events GROUP BY type")
            .fetch_all(self.pool())
            .await?;
        let mut events_by_type = BTreeMap::new();
        for type_row in type_rows {
            events_by_type.insert(type_row.try_get("type")?, type_row.try_get("count")?);
        }

        Ok(FeedStats {
            total_events: row.try_get("total_events")?,
            total_votes: row.try_get("total_votes")?,
            total_voters: row.try_get("total_voters")?,
            latest_event_at: row.try_get("latest_event_at")?,
            events_last_hour: row.try_get("events_last_hour")?,
            events_by_type,
        })
    }

    /// Reaction kind counts per comment.
    pub async fn comment_reaction_counts(
        &self,
        comment_ids: &[i64],
    ) -> Result<HashMap<i64, BTreeMap<String, i64>>, StoreError> {
        if comment_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT comment_id AS parent, reaction_type, COUNT(*) AS count
              FROM events
             WHERE type = 'reaction'
               AND comment_id = ANY($1)
               AND reaction_type IS NOT NULL
             GROUP BY comment_id, reaction_type
            "#,
        )
        .bind(comment_ids)
        .fetch_all(self.pool())
        .await?;
        group_counts::<i64>(&rows)
    }

    /// Reaction kind counts on pull requests themselves, comment reactions excluded.
    pub async fn pr_reaction_counts(
        &self,
        pr_numbers: &[i32],
    ) -> Result<HashMap<i32, BTreeMap<String, i64>>, StoreError> {
        if pr_numbers.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT pr_number AS parent, reaction_type, COUNT(*) AS count
              FROM events
             WHERE type = 'reaction'
               AND pr_number = ANY($1)
               AND comment_id IS NULL
               AND reaction_type IS NOT NULL
             GROUP BY pr_number, reaction_type
            "#,
        )
        .bind(pr_numbers)
        .fetch_all(self.pool())
        .await?;
        group_counts::<i32>(&rows)
    }
}

fn group_counts<K>(rows: &[PgRow]) -> Result<HashMap<K, BTreeMap<String, i64>>, StoreError>
where
    K: std::hash::Hash + Eq + for<'r> sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    let mut out: HashMap<K, BTreeMap<String, i64>> = HashMap::new();
    for row in rows {
        let parent: K = row.try_get("parent")?;
        let kind: String = row.try_get("reaction_type")?;
        let count: i64 = row.try_get("count")?;
        out.entry(parent).or_default().insert(kind, count);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_queries_exclude_comment_reactions() {
        let sql = voter_query(" AND github_user = $1");
        assert!(sql.contains("comment_id IS NULL"));
        assert!(sql.contains("choice IS NOT NULL"));
        assert!(sql.contains("github_user = $1"));
        assert!(sql.contains("FILTER (WHERE pr_number IS NOT NULL)"));
    }

    #[test]
    fn tallies_count_each_choice_on_the_pull_request_only() {
        let sql = tally_query();
        assert!(sql.contains("FILTER (WHERE choice = 1) AS upvotes"));
        assert!(sql.contains("FILTER (WHERE choice = -1) AS downvotes"));
        assert!(sql.contains(&format!("{VOTE_PREDICATE} AND pr_number = $1")));
    }

    #[test]
    fn stats_restrict_vote_totals_but_not_event_totals() {
        let sql = stats_query();
        assert!(sql.contains("COUNT(*) AS total_events,"));
        assert!(sql.contains(&format!("COUNT(*) FILTER (WHERE {VOTE_PREDICATE}) AS total_votes")));
        assert!(sql.contains(&format!(
            "COUNT(DISTINCT github_user) FILTER (WHERE {VOTE_PREDICATE}) AS total_voters"
        )));
        assert!(sql.contains("INTERVAL '1 hour'"));
        assert!(sql.trim_end().ends_with("FROM events"), "no outer filter on the events scan");
    }

    #[test]
    fn leaderboard_orders_by_total_votes() {
        assert!(voter_query("").contains("ORDER BY total_votes DESC"));
    }
}
