//! Sync orchestration: recent refresh, resumable backfill, prune, derived outputs.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sweaty_core::config::Config;
use sweaty_core::{BackfillCursor, Source};
use sweaty_providers::{Page, ProviderClient, ProviderError};
use sweaty_storage::{ActivityStore, BackoffPolicy, CursorStore, HttpClientConfig, UpsertOutcome};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod aggregate;
pub mod normalize;
pub mod outputs;

pub use aggregate::{aggregate, HeatmapReport};
pub use normalize::{normalize, DropReason, NormalizationDrop};
pub use outputs::DataLayout;

pub const CRATE_NAME: &str = "sweaty-sync";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("SWEATY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            user_agent: std::env::var("SWEATY_USER_AGENT")
                .unwrap_or_else(|_| "sweaty-sync/0.1".to_string()),
            http_timeout_secs: std::env::var("SWEATY_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Shared cancellation flag, checked between pages.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// OR-ed with `sync.prune_deleted`.
    pub prune_deleted: bool,
    pub reset_backfill: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BackfillComplete,
    AlreadyComplete,
    RateLimited,
    TransientFailure,
    Interrupted,
    AuthFailed,
    ProviderFailed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::BackfillComplete => "backfill_complete",
            StopReason::AlreadyComplete => "already_complete",
            StopReason::RateLimited => "rate_limited",
            StopReason::TransientFailure => "transient_failure",
            StopReason::Interrupted => "interrupted",
            StopReason::AuthFailed => "auth_failed",
            StopReason::ProviderFailed => "provider_failed",
        }
    }

    /// Auth and fatal provider errors fail the run; everything else is a
    /// clean stop that the next run resumes from.
    pub fn is_failure(&self) -> bool {
        matches!(self, StopReason::AuthFailed | StopReason::ProviderFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneOutcome {
    Applied,
    SkippedIncompleteBackfill,
    SkippedScanStopped,
}

impl PruneOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PruneOutcome::Applied => "applied",
            PruneOutcome::SkippedIncompleteBackfill => "skipped (backfill incomplete)",
            PruneOutcome::SkippedScanStopped => "skipped (verification scan stopped early)",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source: Source,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub stop_reason: StopReason,
    pub fetched: usize,
    pub new_or_updated: usize,
    pub unchanged: usize,
    pub dropped: usize,
    pub dropped_by_reason: BTreeMap<String, usize>,
    pub out_of_scope: usize,
    pub malformed: usize,
    pub deleted: usize,
    /// Stored records re-grouped under the current activity settings.
    pub reclassified: usize,
    /// Stored records removed because the current settings exclude them.
    pub evicted: usize,
    /// Stored history was discarded because the credentials changed account.
    pub account_reset: bool,
    pub pages: usize,
    pub backfill_completed: bool,
    pub rate_limited: bool,
    pub retry_after_secs: Option<u64>,
    pub prune: Option<PruneOutcome>,
    pub stored_activities: usize,
    pub error: Option<String>,
}

impl SyncRunSummary {
    /// Turn a source-level failure into an error once outputs are written.
    pub fn ensure_success(&self) -> Result<()> {
        if self.stop_reason.is_failure() {
            bail!(
                "{} sync failed ({}): {}",
                self.source,
                self.stop_reason.as_str(),
                self.error.as_deref().unwrap_or("no detail")
            );
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RunStats {
    fetched: usize,
    new_or_updated: usize,
    unchanged: usize,
    dropped: BTreeMap<DropReason, usize>,
    out_of_scope: usize,
    malformed: usize,
    deleted: usize,
    reclassified: usize,
    evicted: usize,
    pages: usize,
    seen: HashSet<String>,
}

#[derive(Debug)]
struct SourceOutcome {
    stop_reason: StopReason,
    retry_after: Option<Duration>,
    backfill_completed: bool,
    prune: Option<PruneOutcome>,
    error: Option<String>,
}

/// Why a fetch loop ended before reaching its target.
enum Halt {
    /// Progress so far is persisted; the next run resumes.
    Stop(StopReason, Option<Duration>),
    /// The source's run is abandoned with its cursor untouched.
    Abort(StopReason, String),
    /// Local persistence failed; the whole run fails.
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for Halt {
    fn from(err: anyhow::Error) -> Self {
        Halt::Storage(err)
    }
}

impl From<ProviderError> for Halt {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { retry_after } => {
                Halt::Stop(StopReason::RateLimited, Some(retry_after))
            }
            ProviderError::Transient(_) => Halt::Stop(StopReason::TransientFailure, None),
            ProviderError::AuthExpired(msg) => Halt::Abort(StopReason::AuthFailed, msg),
            ProviderError::Fatal(msg) => Halt::Abort(StopReason::ProviderFailed, msg),
        }
    }
}

pub struct SyncPipeline {
    config: Config,
    layout: DataLayout,
    cursors: CursorStore,
    provider: Box<dyn ProviderClient>,
    backoff: BackoffPolicy,
    interrupt: Interrupt,
    clock: Option<DateTime<Utc>>,
}

impl SyncPipeline {
    pub fn new(
        config: Config,
        data_dir: impl Into<PathBuf>,
        provider: Box<dyn ProviderClient>,
    ) -> Result<Self> {
        if provider.source() != config.source {
            bail!(
                "provider client is for {} but the configured source is {}",
                provider.source(),
                config.source
            );
        }
        let data_dir = data_dir.into();
        Ok(Self {
            config,
            layout: DataLayout::new(data_dir.clone()),
            cursors: CursorStore::new(data_dir),
            provider,
            backoff: BackoffPolicy::default(),
            interrupt: Interrupt::default(),
            clock: None,
        })
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Pin "now" for lower-bound and recent-window math.
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.clock = Some(now);
        self
    }

    pub async fn run_once(&self, options: RunOptions) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let now = self.clock.unwrap_or(started_at);
        let run_id = Uuid::new_v4();
        let source = self.config.source;
        let write = !options.dry_run;

        let previous = outputs::read_marker(&self.layout).await;
        outputs::note_source_switch(previous.as_ref(), source);
        let account = self.provider.account_fingerprint();
        let account_reset = previous
            .as_ref()
            .is_some_and(|marker| marker.account_changed(source, account.as_deref()));

        let mut store = ActivityStore::open(self.layout.activities()).await?;
        let mut stats = RunStats::default();
        let mut options = options;
        if account_reset {
            let removed = store.remove_source(source);
            warn!(%source, removed, "credentials belong to a different account; discarding stored history");
            options.reset_backfill = true;
        }

        let span = info_span!("source_sync", %source, %run_id, dry_run = options.dry_run);
        let outcome = self
            .sync_source(&mut store, &mut stats, options, now)
            .instrument(span)
            .await?;

        if write {
            store.save().await?;
            outputs::write_derived_outputs(&self.layout, &store, &self.config).await?;
            // only once the reset is on disk, so an interrupted reset repeats
            let marker = outputs::SourceMarker::next(previous, source, account.as_deref(), now);
            outputs::write_marker(&self.layout, &marker).await?;
        }

        let summary = SyncRunSummary {
            run_id,
            source,
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            stop_reason: outcome.stop_reason,
            fetched: stats.fetched,
            new_or_updated: stats.new_or_updated,
            unchanged: stats.unchanged,
            dropped: stats.dropped.values().sum(),
            dropped_by_reason: stats
                .dropped
                .iter()
                .map(|(reason, count)| (reason.as_str().to_string(), *count))
                .collect(),
            out_of_scope: stats.out_of_scope,
            malformed: stats.malformed,
            deleted: stats.deleted,
            reclassified: stats.reclassified,
            evicted: stats.evicted,
            account_reset,
            pages: stats.pages,
            backfill_completed: outcome.backfill_completed,
            rate_limited: outcome.stop_reason == StopReason::RateLimited,
            retry_after_secs: outcome.retry_after.map(|d| d.as_secs()),
            prune: outcome.prune,
            stored_activities: store.all(false).count(),
            error: outcome.error,
        };
        if write {
            outputs::write_summary(&self.layout, &summary).await?;
        }
        info!(
            %source,
            stop = summary.stop_reason.as_str(),
            fetched = summary.fetched,
            new_or_updated = summary.new_or_updated,
            dropped = summary.dropped,
            deleted = summary.deleted,
            "sync finished"
        );
        Ok(summary)
    }

    async fn sync_source(
        &self,
        store: &mut ActivityStore,
        stats: &mut RunStats,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Result<SourceOutcome> {
        let source = self.config.source;
        let write = !options.dry_run;
        let lower_bound = self.config.sync.lower_bound(now);
        let fingerprint = self.config.scope_fingerprint();

        let mut cursor = if options.reset_backfill {
            info!("backfill reset requested");
            if write {
                self.cursors.reset(source).await?;
            }
            BackfillCursor::fresh(source)
        } else {
            self.cursors.load(source).await
        };
        if cursor
            .scope_fingerprint
            .as_deref()
            .is_some_and(|previous| previous != fingerprint)
        {
            info!("backfill scope changed; restarting backfill from the newest page");
            cursor = BackfillCursor::fresh(source);
        }
        cursor.scope_fingerprint = Some(fingerprint);
        let (reclassified, evicted) = reapply_settings(store, &self.config);
        stats.reclassified = reclassified;
        stats.evicted = evicted;
        let started_fresh = cursor.page_token.is_none() && !cursor.complete;
        let prune_requested = options.prune_deleted || self.config.sync.prune_deleted;

        if let Err(halt) = self.recent(store, stats, lower_bound, now).await {
            return self
                .halt(halt, store, &mut cursor, write, now, prune_requested)
                .await;
        }

        let mut completed_now = false;
        if cursor.complete {
            debug!("backfill already complete");
        } else {
            match self.backfill(store, stats, &mut cursor, lower_bound, write).await {
                Ok(()) => completed_now = true,
                Err(halt) => {
                    return self
                        .halt(halt, store, &mut cursor, write, now, prune_requested)
                        .await
                }
            }
        }

        let mut outcome = SourceOutcome {
            stop_reason: if completed_now {
                StopReason::BackfillComplete
            } else {
                StopReason::AlreadyComplete
            },
            retry_after: None,
            backfill_completed: cursor.complete,
            prune: None,
            error: None,
        };

        if prune_requested {
            let covered = started_fresh && completed_now;
            let scan = if covered {
                Ok(())
            } else {
                info!("running verification scan before prune");
                self.verification_scan(store, stats, lower_bound).await
            };
            outcome.prune = Some(match scan {
                Ok(()) => {
                    stats.deleted = store.prune(source, &stats.seen, lower_bound);
                    info!(deleted = stats.deleted, "prune applied");
                    PruneOutcome::Applied
                }
                Err(Halt::Stop(reason, retry_after)) => {
                    info!(reason = reason.as_str(), "verification scan stopped early; prune skipped");
                    outcome.stop_reason = reason;
                    outcome.retry_after = retry_after;
                    PruneOutcome::SkippedScanStopped
                }
                Err(Halt::Abort(reason, msg)) => {
                    warn!(reason = reason.as_str(), error = %msg, "verification scan failed; prune skipped");
                    outcome.stop_reason = reason;
                    outcome.error = Some(msg);
                    PruneOutcome::SkippedScanStopped
                }
                Err(Halt::Storage(err)) => return Err(err),
            });
        }

        cursor.last_run_at = Some(now);
        cursor.rate_limited = false;
        if write {
            store.save().await?;
            self.cursors.save(&cursor).await?;
        }
        Ok(outcome)
    }

    async fn recent(
        &self,
        store: &mut ActivityStore,
        stats: &mut RunStats,
        lower_bound: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), Halt> {
        if self.interrupt.is_triggered() {
            return Err(Halt::Stop(StopReason::Interrupted, None));
        }
        let since = self.config.sync.recent_since(now);
        let page = self
            .with_retries("recent", || self.provider.fetch_recent(since))
            .await?;
        info!(fetched = page.records.len(), since = %since, "recent window fetched");
        self.merge(store, stats, page, lower_bound);
        Ok(())
    }

    /// Walk older pages from the cursor until history or the lower bound is
    /// reached.
    async fn backfill(
        &self,
        store: &mut ActivityStore,
        stats: &mut RunStats,
        cursor: &mut BackfillCursor,
        lower_bound: Option<DateTime<Utc>>,
        write: bool,
    ) -> Result<(), Halt> {
        let resume = self.config.sync.resume_backfill;
        loop {
            if self.interrupt.is_triggered() {
                return Err(Halt::Stop(StopReason::Interrupted, None));
            }
            let token = cursor.page_token.clone();
            let page = self
                .with_retries("backfill", || self.provider.fetch_page(token.as_deref()))
                .await?;
            stats.pages += 1;

            let oldest = page.oldest_start();
            let done = page.records.is_empty()
                || page.next_token.is_none()
                || matches!((oldest, lower_bound), (Some(o), Some(lb)) if o <= lb);
            let next_token = page.next_token.clone();
            let fetched = page.records.len();
            self.merge(store, stats, page, lower_bound);

            if done {
                cursor.advance(oldest, None);
                cursor.mark_complete(lower_bound);
            } else {
                cursor.advance(oldest, next_token);
            }
            info!(
                page = stats.pages,
                fetched,
                boundary = ?cursor.oldest_fetched_boundary,
                complete = cursor.complete,
                "backfill page merged"
            );

            if write {
                persist(store, &self.cursors, resume.then_some(&*cursor)).await?;
            }
            if done {
                return Ok(());
            }
        }
    }

    /// Full-scope walk from the newest page used only to collect seen ids for
    /// prune. Merges what it sees but never moves the cursor.
    async fn verification_scan(
        &self,
        store: &mut ActivityStore,
        stats: &mut RunStats,
        lower_bound: Option<DateTime<Utc>>,
    ) -> Result<(), Halt> {
        let mut token: Option<String> = None;
        loop {
            if self.interrupt.is_triggered() {
                return Err(Halt::Stop(StopReason::Interrupted, None));
            }
            let page = self
                .with_retries("verification", || self.provider.fetch_page(token.as_deref()))
                .await?;
            let oldest = page.oldest_start();
            let done = page.records.is_empty()
                || page.next_token.is_none()
                || matches!((oldest, lower_bound), (Some(o), Some(lb)) if o <= lb);
            token = page.next_token.clone();
            self.merge(store, stats, page, lower_bound);
            if done {
                return Ok(());
            }
        }
    }

    async fn halt(
        &self,
        halt: Halt,
        store: &mut ActivityStore,
        cursor: &mut BackfillCursor,
        write: bool,
        now: DateTime<Utc>,
        prune_requested: bool,
    ) -> Result<SourceOutcome> {
        // prune needs a complete, uninterrupted scan
        let prune = prune_requested.then_some(PruneOutcome::SkippedIncompleteBackfill);
        match halt {
            Halt::Stop(reason, retry_after) => {
                info!(
                    reason = reason.as_str(),
                    retry_after_secs = retry_after.map(|d| d.as_secs()),
                    boundary = ?cursor.oldest_fetched_boundary,
                    "stopping early; progress persisted"
                );
                cursor.last_run_at = Some(now);
                cursor.rate_limited = reason == StopReason::RateLimited;
                if write {
                    persist(store, &self.cursors, Some(&*cursor)).await?;
                }
                Ok(SourceOutcome {
                    stop_reason: reason,
                    retry_after,
                    backfill_completed: cursor.complete,
                    prune,
                    error: None,
                })
            }
            Halt::Storage(err) => Err(err),
            Halt::Abort(reason, msg) => {
                warn!(reason = reason.as_str(), error = %msg, "source sync aborted; cursor left untouched");
                if write {
                    persist(store, &self.cursors, None).await?;
                }
                Ok(SourceOutcome {
                    stop_reason: reason,
                    retry_after: None,
                    backfill_completed: cursor.complete,
                    prune,
                    error: Some(msg),
                })
            }
        }
    }

    fn merge(
        &self,
        store: &mut ActivityStore,
        stats: &mut RunStats,
        page: Page,
        lower_bound: Option<DateTime<Utc>>,
    ) {
        stats.fetched += page.records.len();
        stats.malformed += page.malformed;
        for raw in page.records {
            if lower_bound.is_some_and(|lb| raw.start_time < lb) {
                stats.out_of_scope += 1;
                continue;
            }
            match normalize(&raw, &self.config.activities) {
                Ok(activity) => {
                    stats.seen.insert(activity.source_id.clone());
                    match store.upsert(activity) {
                        UpsertOutcome::Inserted | UpsertOutcome::Updated => {
                            stats.new_or_updated += 1
                        }
                        UpsertOutcome::Unchanged => stats.unchanged += 1,
                    }
                }
                Err(drop) => {
                    debug!(
                        id = %raw.source_id,
                        raw_type = %drop.raw_type,
                        reason = drop.reason.as_str(),
                        "activity dropped"
                    );
                    *stats.dropped.entry(drop.reason).or_default() += 1;
                }
            }
        }
    }

    /// Retry transient failures with backoff; anything else returns at once.
    async fn with_retries<T, F, Fut>(&self, what: &'static str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0usize;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient provider failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Store first, then cursor: a crash in between only causes a refetch.
async fn persist(
    store: &mut ActivityStore,
    cursors: &CursorStore,
    cursor: Option<&BackfillCursor>,
) -> Result<()> {
    store.save().await?;
    if let Some(cursor) = cursor {
        cursors.save(cursor).await?;
    }
    Ok(())
}

/// Clear the selected source's backfill cursor.
pub async fn reset_backfill(data_dir: impl Into<PathBuf>, source: Source) -> Result<()> {
    CursorStore::new(data_dir).reset(source).await?;
    info!(%source, "backfill cursor cleared");
    Ok(())
}

/// Bring stored records of the configured source in line with the current
/// activity settings. Returns `(reclassified, evicted)`.
fn reapply_settings(store: &mut ActivityStore, config: &Config) -> (usize, usize) {
    let (reclassified, evicted) = store.rederive(config.source, |activity| {
        match normalize::renormalize(activity, &config.activities) {
            Ok(next) => Some(next),
            Err(drop) => {
                debug!(
                    id = %activity.source_id,
                    raw_type = %drop.raw_type,
                    reason = drop.reason.as_str(),
                    "stored activity no longer selected"
                );
                None
            }
        }
    });
    if reclassified + evicted > 0 {
        info!(reclassified, evicted, "stored activities re-normalized under current settings");
    }
    (reclassified, evicted)
}

/// Rebuild normalized and aggregate outputs from the stored activities only,
/// applying the current activity settings to them first.
pub async fn regenerate_outputs(config: &Config, data_dir: impl Into<PathBuf>) -> Result<HeatmapReport> {
    let layout = DataLayout::new(data_dir);
    let mut store = ActivityStore::open(layout.activities()).await?;
    reapply_settings(&mut store, config);
    store.save().await?;
    outputs::write_derived_outputs(&layout, &store, config).await
}
