//! Rate-limited platform API client (REST + GraphQL) and the open-item cache.

mod cache;
mod graphql;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

pub use cache::{ItemState, OpenItem, OpenItemCache, DEFAULT_OPEN_ITEM_TTL};
pub use types::{
    Discussion, DiscussionComment, DiscussionReaction, Fork, GraphQlAuthor, IssueComment,
    IssueSummary, PullRequestSummary, RawFeedEvent, Reaction, RepoSlug, Stargazer, UserRef,
};

pub const CRATE_NAME: &str = "chaosfeed-github";

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.github.com/graphql";

const EVENTS_PAGE_CAP: usize = 10;
const OPEN_PULLS_PAGE_CAP: usize = 10;
const ALL_PULLS_PAGE_CAP: usize = 30;
const ALL_ISSUES_PAGE_CAP: usize = 30;
const ALL_COMMENTS_PAGE_CAP: usize = 100;
const ISSUE_REACTIONS_PAGE_CAP: usize = 50;
const COMMENT_REACTIONS_PAGE_CAP: usize = 10;
const STARGAZERS_PAGE_CAP: usize = 100;
const FORKS_PAGE_CAP: usize = 100;
const STAR_MEDIA_TYPE: &str = "application/vnd.github.star+json";
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule for transient failures within a single request.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// When the remaining quota falls below `low_water` and the window resets
/// within `max_wait`, requests pause until the reset plus `safety_margin`.
#[derive(Debug, Clone, Copy)]
pub struct QuotaPolicy {
    pub low_water: u32,
    pub max_wait: Duration,
    pub safety_margin: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            low_water: 10,
            max_wait: Duration::from_secs(15 * 60),
            safety_margin: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: Option<u32>,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimit {
    /// Reads the `x-ratelimit-*` headers. Both remaining and reset must be present.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        fn number<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        }

        let remaining = number::<u32>(headers, "x-ratelimit-remaining")?;
        let reset_secs = number::<i64>(headers, "x-ratelimit-reset")?;
        Some(Self {
            limit: number(headers, "x-ratelimit-limit"),
            remaining,
            reset_at: DateTime::from_timestamp(reset_secs, 0)?,
        })
    }

    pub fn backoff_delay(&self, now: DateTime<Utc>, policy: &QuotaPolicy) -> Option<Duration> {
        if self.remaining >= policy.low_water {
            return None;
        }
        let until_reset = (self.reset_at - now).to_std().ok()?;
        if until_reset > policy.max_wait {
            return None;
        }
        Some(until_reset + policy.safety_margin)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("rate limited (resets at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("graphql error: {0}")]
    GraphQl(String),
    #[error("invalid repository identifier {0:?}, expected owner/repo")]
    InvalidRepo(String),
    #[error("request cancelled by shutdown")]
    Cancelled,
}

/// Result of a cache-validated fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult<T> {
    NotModified,
    Fetched {
        data: T,
        etag: Option<String>,
        pages: usize,
    },
}

#[derive(Debug)]
pub struct GitHubConfig {
    pub api_url: String,
    pub graphql_url: String,
    pub token: SecretString,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_concurrent_requests: usize,
    pub backoff: BackoffPolicy,
    pub quota: QuotaPolicy,
}

impl GitHubConfig {
    pub fn new(token: SecretString) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            token,
            user_agent: format!("chaosfeed/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_concurrent_requests: 8,
            backoff: BackoffPolicy::default(),
            quota: QuotaPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    graphql_url: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
    quota: QuotaPolicy,
    last_rate_limit: Mutex<Option<RateLimit>>,
    shutdown: CancellationToken,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> anyhow::Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token.expose_secret()))
            .context("platform token contains invalid header characters")?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );

        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            graphql_url: config.graphql_url,
            limit: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            backoff: config.backoff,
            quota: config.quota,
            last_rate_limit: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Ties every network wait and backoff sleep to `token`.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Most recent quota observed on any response.
    pub async fn last_rate_limit(&self) -> Option<RateLimit> {
        *self.last_rate_limit.lock().await
    }

    /// Conditional fetch of the repository activity feed, following `next`
    /// links. An unchanged feed short-circuits to `NotModified`.
    pub async fn repo_events(
        &self,
        repo: &RepoSlug,
        etag: Option<&str>,
    ) -> Result<FetchResult<Vec<RawFeedEvent>>, FetchError> {
        let url = format!("{}/repos/{repo}/events?per_page=100", self.api_url);
        let first = self
            .send(|http| {
                let request = http.get(&url);
                match etag {
                    Some(tag) => request.header(header::IF_NONE_MATCH, tag),
                    None => request,
                }
            })
            .await?;

        if first.status() == StatusCode::NOT_MODIFIED {
            debug!(%repo, "event feed unchanged");
            return Ok(FetchResult::NotModified);
        }

        let etag = first
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let (data, pages) = self.paginate(first, None, EVENTS_PAGE_CAP).await?;
        Ok(FetchResult::Fetched { data, etag, pages })
    }

    pub async fn open_pull_requests(
        &self,
        repo: &RepoSlug,
    ) -> Result<Vec<PullRequestSummary>, FetchError> {
        let url = format!(
            "{}/repos/{repo}/pulls?state=open&per_page=100",
            self.api_url
        );
        self.get_list(url, None, OPEN_PULLS_PAGE_CAP).await
    }

    pub async fn all_pull_requests(
        &self,
        repo: &RepoSlug,
    ) -> Result<Vec<PullRequestSummary>, FetchError> {
        let url = format!(
            "{}/repos/{repo}/pulls?state=all&sort=created&direction=asc&per_page=100",
            self.api_url
        );
        self.get_list(url, None, ALL_PULLS_PAGE_CAP).await
    }

    /// Every issue, oldest first. Pull requests returned by the same
    /// listing are dropped.
    pub async fn all_issues(&self, repo: &RepoSlug) -> Result<Vec<IssueSummary>, FetchError> {
        let url = format!(
            "{}/repos/{repo}/issues?state=all&sort=created&direction=asc&per_page=100",
            self.api_url
        );
        let listed: Vec<IssueSummary> = self.get_list(url, None, ALL_ISSUES_PAGE_CAP).await?;
        Ok(listed.into_iter().filter(|i| !i.is_pull_request()).collect())
    }

    /// Every issue and pull request conversation comment in the repository.
    pub async fn all_issue_comments(
        &self,
        repo: &RepoSlug,
    ) -> Result<Vec<IssueComment>, FetchError> {
        let url = format!(
            "{}/repos/{repo}/issues/comments?sort=created&direction=asc&per_page=100",
            self.api_url
        );
        self.get_list(url, None, ALL_COMMENTS_PAGE_CAP).await
    }

    /// Reactions on a pull request or issue (both live under the issues API).
    pub async fn issue_reactions(
        &self,
        repo: &RepoSlug,
        number: i32,
    ) -> Result<Vec<Reaction>, FetchError> {
        let url = format!(
            "{}/repos/{repo}/issues/{number}/reactions?per_page=100",
            self.api_url
        );
        self.get_list(url, None, ISSUE_REACTIONS_PAGE_CAP).await
    }

    pub async fn comment_reactions(
        &self,
        repo: &RepoSlug,
        comment_id: i64,
    ) -> Result<Vec<Reaction>, FetchError> {
        let url = format!(
            "{}/repos/{repo}/issues/comments/{comment_id}/reactions?per_page=100",
            self.api_url
        );
        self.get_list(url, None, COMMENT_REACTIONS_PAGE_CAP).await
    }

    pub async fn stargazers(&self, repo: &RepoSlug) -> Result<Vec<Stargazer>, FetchError> {
        let url = format!("{}/repos/{repo}/stargazers?per_page=100", self.api_url);
        self.get_list(url, Some(STAR_MEDIA_TYPE), STARGAZERS_PAGE_CAP)
            .await
    }

    pub async fn forks(&self, repo: &RepoSlug) -> Result<Vec<Fork>, FetchError> {
        let url = format!(
            "{}/repos/{repo}/forks?sort=oldest&per_page=100",
            self.api_url
        );
        self.get_list(url, None, FORKS_PAGE_CAP).await
    }

    /// Queries the quota-status endpoint. This call is free and never pauses.
    pub async fn rate_limit(&self) -> Result<RateLimit, FetchError> {
        #[derive(Deserialize)]
        struct Envelope {
            rate: Window,
        }
        #[derive(Deserialize)]
        struct Window {
            limit: u32,
            remaining: u32,
            reset: i64,
        }

        let url = format!("{}/rate_limit", self.api_url);
        let (response, _) = self.execute(|http| http.get(&url)).await?;
        let bytes = response.bytes().await?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|source| FetchError::Decode { url: url.clone(), source })?;

        let rate = RateLimit {
            limit: Some(envelope.rate.limit),
            remaining: envelope.rate.remaining,
            reset_at: DateTime::from_timestamp(envelope.rate.reset, 0).unwrap_or_else(Utc::now),
        };
        *self.last_rate_limit.lock().await = Some(rate);
        Ok(rate)
    }

    /// Checks the quota endpoint and pauses if it is running low.
    pub async fn wait_for_quota(&self) -> Result<(), FetchError> {
        let rate = self.rate_limit().await?;
        self.pause_for_quota(&rate).await
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        url: String,
        accept: Option<&'static str>,
        max_pages: usize,
    ) -> Result<Vec<T>, FetchError> {
        let first = self.send(|http| with_accept(http.get(&url), accept)).await?;
        let (items, _) = self.paginate(first, accept, max_pages).await?;
        Ok(items)
    }

    /// Follows `Link: rel="next"` up to `max_pages` in total. A failure after
    /// the first page ends pagination and keeps what was collected.
    async fn paginate<T: DeserializeOwned>(
        &self,
        first: reqwest::Response,
        accept: Option<&'static str>,
        max_pages: usize,
    ) -> Result<(Vec<T>, usize), FetchError> {
        let mut next = next_link_from(first.headers());
        let mut items = decode_items::<T>(first).await?;
        let mut pages = 1;

        while let Some(url) = next.take() {
            if pages >= max_pages {
                debug!(url = %url, pages, "page cap reached");
                break;
            }

            let response = match self.send(|http| with_accept(http.get(&url), accept)).await {
                Ok(response) => response,
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(err) => {
                    warn!(url = %url, pages, error = %err, "pagination stopped early, keeping partial results");
                    break;
                }
            };

            next = next_link_from(response.headers());
            match decode_items::<T>(response).await {
                Ok(mut page) => {
                    items.append(&mut page);
                    pages += 1;
                }
                Err(err) => {
                    warn!(url = %url, pages, error = %err, "undecodable page, keeping partial results");
                    break;
                }
            }
        }

        Ok((items, pages))
    }

    /// `execute` followed by the proactive quota pause.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let (response, rate) = self.execute(build).await?;
        if let Some(rate) = rate {
            self.pause_for_quota(&rate).await?;
        }
        Ok(response)
    }

    async fn execute<F>(
        &self,
        build: F,
    ) -> Result<(reqwest::Response, Option<RateLimit>), FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let request = build(&self.http).build()?;
        let span = info_span!("http_fetch", url = %request.url());
        self.execute_with_retry(build).instrument(span).await
    }

    async fn execute_with_retry<F>(
        &self,
        build: F,
    ) -> Result<(reqwest::Response, Option<RateLimit>), FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _permit = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(FetchError::Cancelled),
            permit = self.limit.acquire() => permit.map_err(|_| FetchError::Cancelled)?,
        };

        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(FetchError::Cancelled),
                result = build(&self.http).send() => result,
            };

            match result {
                Ok(response) => {
                    let status = response.status();
                    let rate = RateLimit::from_headers(response.headers());
                    if let Some(rate) = rate {
                        *self.last_rate_limit.lock().await = Some(rate);
                    }

                    if status.is_success() || status == StatusCode::NOT_MODIFIED {
                        return Ok((response, rate));
                    }

                    let exhausted = rate.is_some_and(|r| r.remaining == 0);
                    if exhausted
                        && (status == StatusCode::FORBIDDEN
                            || status == StatusCode::TOO_MANY_REQUESTS)
                    {
                        return Err(FetchError::RateLimited {
                            reset_at: rate.map(|r| r.reset_at),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after transient status");
                        self.sleep(self.backoff.delay_for_attempt(attempt)).await?;
                        attempt += 1;
                        continue;
                    }

                    let url = response.url().to_string();
                    let mut body = response.text().await.unwrap_or_default();
                    body.truncate(floor_char_boundary(&body, ERROR_BODY_LIMIT));
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        self.sleep(self.backoff.delay_for_attempt(attempt)).await?;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    async fn pause_for_quota(&self, rate: &RateLimit) -> Result<(), FetchError> {
        let Some(delay) = rate.backoff_delay(Utc::now(), &self.quota) else {
            return Ok(());
        };
        warn!(
            remaining = rate.remaining,
            reset_at = %rate.reset_at,
            wait_ms = delay.as_millis() as u64,
            "quota low, pausing until reset"
        );
        self.sleep(delay).await
    }

    async fn sleep(&self, delay: Duration) -> Result<(), FetchError> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn with_accept(
    request: reqwest::RequestBuilder,
    accept: Option<&'static str>,
) -> reqwest::RequestBuilder {
    match accept {
        Some(media_type) => request.header(header::ACCEPT, media_type),
        None => request,
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

/// Decodes a JSON array page. Elements that do not match `T` are logged and skipped.
async fn decode_items<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<Vec<T>, FetchError> {
    let url = response.url().to_string();
    let bytes = response.bytes().await?;
    let raw: Vec<serde_json::Value> = serde_json::from_slice(&bytes).map_err(|source| {
        FetchError::Decode {
            url: url.clone(),
            source,
        }
    })?;

    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(url = %url, error = %err, "skipping malformed item");
                None
            }
        })
        .collect())
}

fn next_link_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::LINK)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_link_next)
}

/// Extracts the `rel="next"` target from an RFC 8288 `Link` header.
pub fn parse_link_next(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut segments = part.split(';');
        let target = segments.next()?.trim();
        let is_next = segments.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')?
            .strip_suffix('>')
            .map(str::to_owned)
    })
}
