//! The three poll loops.
//!
//! Each loop fires once at start and then on its interval. A cycle records
//! its start on the status board before doing any work, never terminates the
//! process, and gives up early after [`CIRCUIT_BREAKER_THRESHOLD`] consecutive
//! store failures. Shutdown is observed at the timer, between work items and
//! inside every network wait; [`IngesterHandle::stop`] joins all loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chaosfeed_core::NewEvent;
use chaosfeed_github::{FetchError, FetchResult, GitHubClient, ItemState, OpenItemCache, RepoSlug};
use chaosfeed_normalize::{
    normalize_discussion, normalize_reaction, Mutation, Normalizer, OpenItemChange, ReactionParent,
};
use chaosfeed_store::InsertOutcome;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::sink::EventSink;
use crate::status::{IngesterStatus, LoopKind, StatusBoard};

pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
/// Every Nth reaction cycle scans all pull requests instead of the open ones.
pub const FULL_SCAN_EVERY: u64 = 10;

#[derive(Debug, Clone)]
pub struct IngesterSettings {
    pub repo: RepoSlug,
    pub poll_interval: Duration,
    pub reactions_interval: Duration,
    pub discussions_interval: Duration,
    pub discussions_enabled: bool,
}

impl From<&FeedConfig> for IngesterSettings {
    fn from(config: &FeedConfig) -> Self {
        Self {
            repo: config.repo.clone(),
            poll_interval: config.poll_interval,
            reactions_interval: config.reactions_interval,
            discussions_interval: config.discussions_interval,
            discussions_enabled: config.discussions_enabled,
        }
    }
}

/// Counts consecutive store failures within one cycle.
#[derive(Debug)]
struct CircuitBreaker {
    consecutive: u32,
    threshold: u32,
}

impl CircuitBreaker {
    fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold,
        }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true once the threshold is reached.
    fn failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.threshold
    }

    fn is_open(&self) -> bool {
        self.consecutive >= self.threshold
    }
}

/// Per-cycle tallies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub skipped: usize,
    pub mutations: usize,
    pub aborted: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: &InsertOutcome) {
        match outcome {
            InsertOutcome::Stored { .. } => self.stored += 1,
            InsertOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

pub struct Ingester {
    client: Arc<GitHubClient>,
    sink: Arc<dyn EventSink>,
    normalizer: Normalizer,
    cache: Arc<OpenItemCache>,
    status: Arc<StatusBoard>,
    settings: IngesterSettings,
    etag: Mutex<Option<String>>,
    reactions_cycle: AtomicU64,
}

impl Ingester {
    /// `client` should carry the same shutdown token later passed to
    /// [`spawn`](Self::spawn) so in-flight requests and backoff sleeps end
    /// with the loops.
    pub fn new(
        client: Arc<GitHubClient>,
        sink: Arc<dyn EventSink>,
        cache: Arc<OpenItemCache>,
        settings: IngesterSettings,
    ) -> Self {
        Self {
            client,
            sink,
            normalizer: Normalizer::standard(),
            cache,
            status: Arc::new(StatusBoard::new()),
            settings,
            etag: Mutex::new(None),
            reactions_cycle: AtomicU64::new(0),
        }
    }

    pub fn status_board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.status)
    }

    pub fn cache(&self) -> Arc<OpenItemCache> {
        Arc::clone(&self.cache)
    }

    pub fn spawn(self, shutdown: CancellationToken) -> IngesterHandle {
        let status = self.status_board();
        let this = Arc::new(self);
        let tasks = LoopKind::ALL
            .into_iter()
            .map(|kind| {
                let ingester = Arc::clone(&this);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { ingester.run_loop(kind, shutdown).await })
            })
            .collect();
        info!(repo = %this.settings.repo, "ingester started");
        IngesterHandle {
            shutdown,
            tasks,
            status,
        }
    }

    fn interval_for(&self, kind: LoopKind) -> Duration {
        match kind {
            LoopKind::Events => self.settings.poll_interval,
            LoopKind::Reactions => self.settings.reactions_interval,
            LoopKind::Discussions => self.settings.discussions_interval,
        }
    }

    async fn run_loop(&self, kind: LoopKind, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval_for(kind));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match kind {
                LoopKind::Events => {
                    self.poll_events(&shutdown).await;
                }
                LoopKind::Reactions => {
                    self.poll_reactions(&shutdown).await;
                }
                LoopKind::Discussions => {
                    self.poll_discussions(&shutdown).await;
                }
            }
        }
        info!(poll_loop = kind.as_str(), "poll loop stopped");
    }

    /// Inserts one event, feeding the breaker. Returns false once it trips.
    async fn store(
        &self,
        event: &NewEvent,
        breaker: &mut CircuitBreaker,
        report: &mut CycleReport,
    ) -> bool {
        match self.sink.insert(event).await {
            Ok(outcome) => {
                breaker.success();
                report.record(&outcome);
                true
            }
            Err(err) => {
                error!(
                    event_type = %event.event_type,
                    external_id = ?event.external_id,
                    error = %err,
                    "failed to store event"
                );
                report.failed += 1;
                !breaker.failure()
            }
        }
    }

    async fn apply_mutation(
        &self,
        mutation: &Mutation,
        breaker: &mut CircuitBreaker,
        report: &mut CycleReport,
    ) {
        let (comment_id, result) = match mutation {
            Mutation::EditComment {
                comment_id,
                payload,
                previous_body,
                edited_at,
            } => (
                *comment_id,
                self.sink
                    .update_comment_edit(*comment_id, payload, previous_body, *edited_at)
                    .await,
            ),
            Mutation::DeleteComment { comment_id } => {
                (*comment_id, self.sink.delete_by_comment_id(*comment_id).await)
            }
        };

        match result {
            Ok(()) => {
                breaker.success();
                report.mutations += 1;
            }
            Err(err) if err.is_not_found() => {
                debug!(comment_id, "comment not stored yet, mutation dropped");
            }
            Err(err) => {
                error!(comment_id, error = %err, "failed to apply comment mutation");
                report.failed += 1;
                breaker.failure();
            }
        }
    }

    async fn apply_open_item(&self, change: &OpenItemChange) {
        match change {
            OpenItemChange::Opened { number, title } => {
                self.cache.upsert(*number, ItemState::Open, title.clone()).await;
            }
            OpenItemChange::Closed { number } => {
                self.cache.evict(*number).await;
            }
        }
    }

    /// One activity-feed cycle.
    pub async fn poll_events(&self, shutdown: &CancellationToken) -> CycleReport {
        self.status.begin(LoopKind::Events).await;
        let mut report = CycleReport::default();

        let etag = self.etag.lock().await.clone();
        let (events, new_etag) = match self.client.repo_events(&self.settings.repo, etag.as_deref()).await {
            Ok(FetchResult::NotModified) => {
                self.status.ok(LoopKind::Events).await;
                return report;
            }
            Ok(FetchResult::Fetched { data, etag, pages }) => {
                debug!(events = data.len(), pages, "activity feed fetched");
                (data, etag)
            }
            Err(FetchError::Cancelled) => return report,
            Err(err) => {
                error!(error = %err, "failed to fetch activity feed");
                self.status.error(LoopKind::Events, &err).await;
                return report;
            }
        };

        let mut breaker = CircuitBreaker::new(CIRCUIT_BREAKER_THRESHOLD);
        // The feed is newest first; store oldest first.
        for raw in events.iter().rev() {
            if shutdown.is_cancelled() || breaker.is_open() {
                break;
            }
            let outcome = match self.normalizer.normalize(raw) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(event_id = %raw.id, raw_type = %raw.event_type, error = %err, "skipping malformed event");
                    report.skipped += 1;
                    continue;
                }
            };

            if let Some(change) = &outcome.open_item {
                self.apply_open_item(change).await;
            }
            for event in &outcome.events {
                if !self.store(event, &mut breaker, &mut report).await {
                    break;
                }
            }
            if let Some(mutation) = &outcome.mutation {
                if !breaker.is_open() {
                    self.apply_mutation(mutation, &mut breaker, &mut report).await;
                }
            }
        }

        if breaker.is_open() {
            report.aborted = true;
            warn!(failed = report.failed, "activity cycle aborted after repeated store failures");
            self.status
                .error(LoopKind::Events, "circuit breaker open after repeated store failures")
                .await;
        } else if report.failed > 0 {
            // Keep the old validator so the failed events are refetched next tick.
            warn!(failed = report.failed, "activity cycle had store failures, retrying next tick");
            self.status.ok(LoopKind::Events).await;
        } else if !shutdown.is_cancelled() {
            // Only a complete cycle may short-circuit the next one.
            *self.etag.lock().await = new_etag;
            self.status.ok(LoopKind::Events).await;
        }

        info!(
            stored = report.stored,
            duplicates = report.duplicates,
            mutations = report.mutations,
            skipped = report.skipped,
            failed = report.failed,
            "activity feed processed"
        );
        report
    }

    /// Pull request numbers to scan this cycle.
    async fn reaction_targets(&self, full_scan: bool) -> Result<Vec<i32>, FetchError> {
        if full_scan {
            let pulls = self.client.all_pull_requests(&self.settings.repo).await?;
            self.cache.refresh_from(&pulls).await;
            return Ok(pulls.iter().map(|pr| pr.number).collect());
        }

        let mut open = self.cache.open_numbers().await;
        if open.is_empty() {
            let pulls = self.client.open_pull_requests(&self.settings.repo).await?;
            let seeded = self.cache.refresh_from(&pulls).await;
            debug!(seeded, "open-item cache seeded from listing");
            open = self.cache.open_numbers().await;
        }
        Ok(open)
    }

    /// One reaction cycle.
    pub async fn poll_reactions(&self, shutdown: &CancellationToken) -> CycleReport {
        self.status.begin(LoopKind::Reactions).await;
        let mut report = CycleReport::default();

        let cycle = self.reactions_cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let full_scan = cycle % FULL_SCAN_EVERY == 0;
        let swept = self.cache.sweep_expired().await;
        if swept > 0 {
            debug!(swept, "expired open items swept");
        }

        let numbers = match self.reaction_targets(full_scan).await {
            Ok(numbers) => numbers,
            Err(FetchError::Cancelled) => return report,
            Err(err) => {
                error!(error = %err, full_scan, "failed to list pull requests for reactions");
                self.status.error(LoopKind::Reactions, &err).await;
                return report;
            }
        };

        let mut breaker = CircuitBreaker::new(CIRCUIT_BREAKER_THRESHOLD);
        'items: for number in &numbers {
            if shutdown.is_cancelled() {
                break;
            }
            let reactions = match self.client.issue_reactions(&self.settings.repo, *number).await {
                Ok(reactions) => reactions,
                Err(FetchError::Cancelled) => break,
                Err(err) => {
                    error!(pr_number = number, error = %err, "failed to fetch reactions");
                    continue;
                }
            };
            for reaction in &reactions {
                let event = normalize_reaction(reaction, ReactionParent::PullRequest(*number));
                if !self.store(&event, &mut breaker, &mut report).await {
                    break 'items;
                }
            }
        }

        if breaker.is_open() {
            report.aborted = true;
            warn!(failed = report.failed, "reaction cycle aborted after repeated store failures");
            self.status
                .error(LoopKind::Reactions, "circuit breaker open after repeated store failures")
                .await;
        } else if !shutdown.is_cancelled() {
            self.status.ok(LoopKind::Reactions).await;
        }

        info!(
            prs_checked = numbers.len(),
            stored = report.stored,
            duplicates = report.duplicates,
            full_scan,
            "reactions processed"
        );
        report
    }

    /// One discussions cycle.
    pub async fn poll_discussions(&self, shutdown: &CancellationToken) -> CycleReport {
        self.status.begin(LoopKind::Discussions).await;
        let mut report = CycleReport::default();

        if !self.settings.discussions_enabled {
            debug!("discussions polling disabled");
            self.status.disabled(LoopKind::Discussions).await;
            return report;
        }

        let discussions = match self.client.discussions(&self.settings.repo).await {
            Ok(discussions) => discussions,
            Err(FetchError::Cancelled) => return report,
            Err(err) => {
                error!(error = %err, "failed to fetch discussions");
                self.status.error(LoopKind::Discussions, &err).await;
                return report;
            }
        };

        let mut breaker = CircuitBreaker::new(CIRCUIT_BREAKER_THRESHOLD);
        'discussions: for discussion in &discussions {
            if shutdown.is_cancelled() {
                break;
            }
            for event in normalize_discussion(discussion) {
                if !self.store(&event, &mut breaker, &mut report).await {
                    break 'discussions;
                }
            }
        }

        if breaker.is_open() {
            report.aborted = true;
            warn!(failed = report.failed, "discussion cycle aborted after repeated store failures");
            self.status
                .error(LoopKind::Discussions, "circuit breaker open after repeated store failures")
                .await;
        } else if !shutdown.is_cancelled() {
            self.status.ok(LoopKind::Discussions).await;
        }

        info!(
            discussions = discussions.len(),
            stored = report.stored,
            duplicates = report.duplicates,
            "discussions processed"
        );
        report
    }
}

/// Running loops. Dropping the handle does not stop them; call [`stop`](Self::stop).
pub struct IngesterHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    status: Arc<StatusBoard>,
}

impl IngesterHandle {
    pub fn status_board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.status)
    }

    pub async fn status(&self) -> IngesterStatus {
        self.status.snapshot().await
    }

    /// Signals every loop and waits until all of them have exited.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "poll loop panicked");
            }
        }
        info!("ingester stopped");
    }
}
