//! Read-only HTTP surface over the event store.

pub mod export;
pub mod views;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chaosfeed_core::EventType;
use chaosfeed_store::{
    clamp_list_limit, ExportOptions, ExportStop, ExportSummary, ListFilters, PgEventStore,
    SortOrder, StoreError, DEFAULT_LIST_LIMIT,
};
use chaosfeed_sync::{LoopKind, StatusBoard};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::export::{ExportFormat, ExportWriter};
use crate::views::{
    event_views, EventView, FeedHealthResponse, HealthResponse, ListResponse, PrVoter,
    PrVotesResponse,
};

pub const CRATE_NAME: &str = "chaosfeed-web";

pub const MAX_ITEM_NUMBER: i32 = 1_000_000;
pub const MAX_LOGIN_LEN: usize = 39;
const EXPORT_PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: PgEventStore,
    /// Absent when the server runs without ingestion.
    pub status: Option<Arc<StatusBoard>>,
    pub export: ExportOptions,
}

impl AppState {
    pub fn new(store: PgEventStore) -> Self {
        Self {
            store,
            status: None,
            export: ExportOptions::default(),
        }
    }

    pub fn with_status(mut self, status: Arc<StatusBoard>) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("internal server error")]
    Internal(#[source] StoreError),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(err) => {
                error!(error = %err, "store query failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/feed", get(list_handler))
        .route("/api/feed/health", get(feed_health_handler))
        .route("/api/feed/stats", get(stats_handler))
        .route("/api/feed/export", get(export_handler))
        .route("/api/feed/event/{id}", get(event_handler))
        .route("/api/feed/pr/{number}", get(pr_events_handler))
        .route("/api/feed/issue/{number}", get(issue_events_handler))
        .route("/api/feed/user/{login}", get(user_events_handler))
        .route("/api/feed/voters", get(voters_handler))
        .route("/api/feed/voters/{login}", get(voter_handler))
        .route("/api/feed/votes/pr/{number}", get(pr_votes_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` fires, then drains in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("reading listener address")?;
    info!(%addr, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")
}

/// Query vocabulary shared by list and export. Unparseable filter values are
/// ignored rather than rejected.
#[derive(Debug, Default, Deserialize)]
struct FeedQuery {
    #[serde(rename = "type")]
    types: Option<String>,
    pr: Option<String>,
    issue: Option<String>,
    discussion: Option<String>,
    user: Option<String>,
    since: Option<String>,
    until: Option<String>,
    sort: Option<String>,
    limit: Option<String>,
    cursor: Option<String>,
    exclude_comment_reactions: Option<String>,
    format: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl FeedQuery {
    fn filters(&self) -> ListFilters {
        let types = non_empty(&self.types)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .filter_map(|t| match EventType::from_str(t) {
                        Ok(event_type) => Some(event_type),
                        Err(_) => {
                            debug!(event_type = t, "ignoring unknown type filter");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        ListFilters {
            types,
            pr_number: non_empty(&self.pr).and_then(|raw| raw.parse().ok()),
            issue_number: non_empty(&self.issue).and_then(|raw| raw.parse().ok()),
            discussion_number: non_empty(&self.discussion).and_then(|raw| raw.parse().ok()),
            github_user: non_empty(&self.user).map(str::to_string),
            since: non_empty(&self.since).and_then(parse_timestamp),
            until: non_empty(&self.until).and_then(parse_timestamp),
            exclude_comment_reactions: matches!(
                non_empty(&self.exclude_comment_reactions),
                Some("true" | "1" | "yes")
            ),
        }
    }

    fn sort_or(&self, default: SortOrder) -> SortOrder {
        non_empty(&self.sort)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }

    fn limit(&self) -> i64 {
        clamp_list_limit(
            non_empty(&self.limit)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(DEFAULT_LIST_LIMIT),
        )
    }

    fn cursor(&self) -> Result<Option<Uuid>, ApiError> {
        non_empty(&self.cursor)
            .map(|raw| {
                Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest("invalid cursor".into()))
            })
            .transpose()
    }
}

fn item_number(raw: &str, what: &str) -> Result<i32, ApiError> {
    match raw.parse::<i32>() {
        Ok(n) if (1..=MAX_ITEM_NUMBER).contains(&n) => Ok(n),
        _ => Err(ApiError::BadRequest(format!("invalid {what} number"))),
    }
}

fn login(raw: &str) -> Result<&str, ApiError> {
    if raw.is_empty() || raw.len() > MAX_LOGIN_LEN {
        return Err(ApiError::BadRequest("invalid username".into()));
    }
    Ok(raw)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let (status, database, code) = match state.store.health_check().await {
        Ok(()) => ("ok", "healthy", StatusCode::OK),
        Err(err) => {
            error!(error = %err, "database health check failed");
            ("degraded", "unhealthy", StatusCode::SERVICE_UNAVAILABLE)
        }
    };
    let body = HealthResponse {
        status,
        timestamp: Utc::now(),
        services: BTreeMap::from([("database", database)]),
    };
    (code, Json(body)).into_response()
}

async fn feed_health_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut body = FeedHealthResponse {
        status: "healthy",
        last_event_at: None,
        events_last_hour: 0,
        ingesters: BTreeMap::new(),
    };

    match state.store.stats().await {
        Ok(stats) => {
            body.last_event_at = stats.latest_event_at;
            body.events_last_hour = stats.events_last_hour;
        }
        Err(err) => warn!(error = %err, "feed health without store stats"),
    }

    if let Some(board) = &state.status {
        let snapshot = board.snapshot().await;
        for kind in LoopKind::ALL {
            body.ingesters.insert(kind.as_str(), snapshot.get(kind).clone());
        }
    }

    Json(body).into_response()
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<Response, ApiError> {
    let filters = query.filters();
    let sort = query.sort_or(SortOrder::Newest);
    let limit = query.limit();
    let cursor = query.cursor()?;

    let events = state.store.list(&filters, sort, limit, cursor).await?;
    let total_count = match state.store.count(&filters).await {
        Ok(total) => total,
        Err(err) => {
            warn!(error = %err, "count failed, reporting zero");
            0
        }
    };
    let next_cursor = if events.len() as i64 == limit {
        events.last().map(|e| e.id)
    } else {
        None
    };

    Ok(Json(ListResponse {
        events: event_views(&events),
        next_cursor,
        total_count,
    })
    .into_response())
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(stats).into_response())
}

async fn event_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::BadRequest("invalid event id".into()))?;
    let event = state.store.get_by_id(id).await?;
    Ok(Json(EventView::from(&event)).into_response())
}

async fn pr_events_handler(
    State(state): State<Arc<AppState>>,
    Path(number): Path<String>,
) -> Result<Response, ApiError> {
    let number = item_number(&number, "PR")?;
    let events = state.store.get_by_pr(number).await?;
    Ok(Json(event_views(&events)).into_response())
}

async fn issue_events_handler(
    State(state): State<Arc<AppState>>,
    Path(number): Path<String>,
) -> Result<Response, ApiError> {
    let number = item_number(&number, "issue")?;
    let events = state.store.get_by_issue(number).await?;
    Ok(Json(event_views(&events)).into_response())
}

async fn user_events_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Response, ApiError> {
    let events = state.store.get_by_user(login(&raw)?).await?;
    Ok(Json(event_views(&events)).into_response())
}

async fn voters_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    Ok(Json(state.store.voters().await?).into_response())
}

async fn voter_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Response, ApiError> {
    let voter = state.store.voter(login(&raw)?).await?;
    Ok(Json(voter).into_response())
}

async fn pr_votes_handler(
    State(state): State<Arc<AppState>>,
    Path(number): Path<String>,
) -> Result<Response, ApiError> {
    let number = item_number(&number, "PR")?;
    let tally = state.store.pr_votes(number).await?;
    let details = state.store.pr_vote_details(number).await?;
    Ok(Json(PrVotesResponse {
        pr_number: number,
        upvotes: tally.upvotes,
        downvotes: tally.downvotes,
        net: tally.net(),
        voters: details.into_iter().map(PrVoter::from).collect(),
    })
    .into_response())
}

/// Streams every matching event. The body is fed through an in-memory pipe
/// by a background task; a disconnected client closes the pipe and ends the
/// task at its next write.
async fn export_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
) -> Result<Response, ApiError> {
    let format = ExportFormat::parse(query.format.as_deref())
        .ok_or_else(|| ApiError::BadRequest("invalid format (use ndjson or csv)".into()))?;
    let filters = query.filters();
    let sort = query.sort_or(SortOrder::Oldest);

    let (pipe, reader) = tokio::io::duplex(EXPORT_PIPE_CAPACITY);
    let store = state.store.clone();
    let options = state.export.clone();
    tokio::spawn(async move {
        let mut writer = ExportWriter::new(pipe, format);
        let summary = match writer.start().await {
            Ok(()) => store.export(&filters, sort, &options, &mut writer).await,
            Err(_) => ExportSummary {
                rows: 0,
                stop: ExportStop::SinkClosed,
            },
        };
        info!(
            format = format.as_str(),
            rows = summary.rows,
            stop = ?summary.stop,
            "export finished"
        );
    });

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type()),
            (header::CONTENT_DISPOSITION, format.content_disposition()),
        ],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}
