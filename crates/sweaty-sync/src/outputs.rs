use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sweaty_core::config::Config;
use sweaty_core::{Activity, Source};
use sweaty_storage::{read_json_if_exists, write_json_atomic, ActivityStore};
use tracing::{info, warn};

use crate::aggregate::{aggregate, HeatmapReport};
use crate::SyncRunSummary;

pub const ACTIVITIES_FILE: &str = "activities.json";
pub const NORMALIZED_FILE: &str = "activities_normalized.json";
pub const AGGREGATES_FILE: &str = "daily_aggregates.json";
pub const SUMMARY_JSON_FILE: &str = "last_sync_summary.json";
pub const SUMMARY_TEXT_FILE: &str = "last_sync_summary.txt";
pub const SOURCE_MARKER_FILE: &str = "source_state.json";

/// Paths of every file the engine owns inside the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn activities(&self) -> PathBuf {
        self.root.join(ACTIVITIES_FILE)
    }

    pub fn normalized(&self) -> PathBuf {
        self.root.join(NORMALIZED_FILE)
    }

    pub fn aggregates(&self) -> PathBuf {
        self.root.join(AGGREGATES_FILE)
    }

    pub fn summary_json(&self) -> PathBuf {
        self.root.join(SUMMARY_JSON_FILE)
    }

    pub fn summary_text(&self) -> PathBuf {
        self.root.join(SUMMARY_TEXT_FILE)
    }

    pub fn source_marker(&self) -> PathBuf {
        self.root.join(SOURCE_MARKER_FILE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMarker {
    pub source: Source,
    pub updated_at: DateTime<Utc>,
    /// Credential fingerprint last synced per source.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub accounts: BTreeMap<Source, String>,
}

impl SourceMarker {
    /// True only when both the recorded and the current fingerprint are
    /// known and differ.
    pub fn account_changed(&self, source: Source, account: Option<&str>) -> bool {
        matches!(
            (self.accounts.get(&source), account),
            (Some(recorded), Some(current)) if recorded != current
        )
    }

    /// Marker for this run, keeping other sources' fingerprints.
    pub fn next(
        previous: Option<SourceMarker>,
        source: Source,
        account: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut accounts = previous.map(|m| m.accounts).unwrap_or_default();
        if let Some(account) = account {
            accounts.insert(source, account.to_string());
        }
        Self {
            source,
            updated_at: now,
            accounts,
        }
    }
}

/// Last run's marker; an unreadable file counts as absent.
pub async fn read_marker(layout: &DataLayout) -> Option<SourceMarker> {
    let path = layout.source_marker();
    match read_json_if_exists::<SourceMarker>(&path).await {
        Ok(marker) => marker,
        Err(err) => {
            warn!(path = %path.display(), error = %format!("{err:#}"), "ignoring unreadable source marker");
            None
        }
    }
}

/// Log a source switch against the previous marker. Stored activities of the
/// previous source stay where they are.
pub fn note_source_switch(previous: Option<&SourceMarker>, source: Source) {
    if let Some(prev) = previous.map(|m| m.source).filter(|prev| *prev != source) {
        info!(from = %prev, to = %source, "activity source switched");
    }
}

pub async fn write_marker(layout: &DataLayout, marker: &SourceMarker) -> Result<()> {
    write_json_atomic(&layout.source_marker(), marker).await
}

/// Regenerate the derived outputs from the whole store.
pub async fn write_derived_outputs(
    layout: &DataLayout,
    store: &ActivityStore,
    config: &Config,
) -> Result<HeatmapReport> {
    let live: Vec<&Activity> = store.all(false).collect();
    let days = aggregate(live.iter().copied(), config.heatmaps.day_boundary);
    let report = HeatmapReport::build(&days, &config.units);

    write_json_atomic(&layout.normalized(), &live).await?;
    write_json_atomic(&layout.aggregates(), &report).await?;
    info!(
        activities = live.len(),
        days = report.days.len(),
        "derived outputs written"
    );
    Ok(report)
}

pub async fn write_summary(layout: &DataLayout, summary: &SyncRunSummary) -> Result<()> {
    write_json_atomic(&layout.summary_json(), summary).await?;
    let text = render_summary_text(summary);
    sweaty_storage::write_text_atomic(&layout.summary_text(), &text).await
}

pub fn render_summary_text(summary: &SyncRunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Sync summary ({})", summary.source);
    let _ = writeln!(out, "run: {}", summary.run_id);
    let _ = writeln!(out, "started: {}", summary.started_at.to_rfc3339());
    let _ = writeln!(out, "finished: {}", summary.finished_at.to_rfc3339());
    if summary.dry_run {
        let _ = writeln!(out, "mode: dry-run (nothing written)");
    }
    let _ = writeln!(out, "stop reason: {}", summary.stop_reason.as_str());
    let _ = writeln!(out, "fetched: {}", summary.fetched);
    let _ = writeln!(out, "new or updated: {}", summary.new_or_updated);
    let _ = writeln!(out, "unchanged: {}", summary.unchanged);
    let _ = writeln!(out, "dropped: {}", summary.dropped);
    for (reason, count) in &summary.dropped_by_reason {
        let _ = writeln!(out, "  {reason}: {count}");
    }
    let _ = writeln!(out, "outside lower bound: {}", summary.out_of_scope);
    let _ = writeln!(out, "malformed: {}", summary.malformed);
    let _ = writeln!(out, "deleted: {}", summary.deleted);
    if summary.reclassified > 0 || summary.evicted > 0 {
        let _ = writeln!(out, "re-grouped from store: {}", summary.reclassified);
        let _ = writeln!(out, "removed by current settings: {}", summary.evicted);
    }
    if summary.account_reset {
        let _ = writeln!(out, "account changed: stored history discarded");
    }
    let _ = writeln!(out, "backfill pages: {}", summary.pages);
    let _ = writeln!(out, "backfill completed: {}", summary.backfill_completed);
    let _ = writeln!(out, "rate limited: {}", summary.rate_limited);
    if let Some(secs) = summary.retry_after_secs {
        let _ = writeln!(out, "retry after: {secs}s");
    }
    if let Some(prune) = &summary.prune {
        let _ = writeln!(out, "prune: {}", prune.as_str());
    }
    let _ = writeln!(out, "stored activities: {}", summary.stored_activities);
    if let Some(error) = &summary.error {
        let _ = writeln!(out, "error: {error}");
    }
    out
}
