//! Canonical activity model, backfill cursor, and heatmap output types for sweaty.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod config;
pub mod units;

pub const CRATE_NAME: &str = "sweaty-core";

/// Activity provider. Exactly one is selected per dataset.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[default]
    Strava,
    Garmin,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Strava, Source::Garmin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Strava => "strava",
            Source::Garmin => "garmin",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported source '{0}' (expected strava or garmin)")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strava" => Ok(Source::Strava),
            "garmin" => Ok(Source::Garmin),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// Record decoded from a provider response, before type resolution.
///
/// Distances and elevation are meters, durations are seconds, whatever the
/// provider's display preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawActivity {
    pub source: Source,
    pub source_id: String,
    pub start_time: DateTime<Utc>,
    pub start_time_local: Option<NaiveDateTime>,
    pub sport_type: Option<String>,
    pub activity_type: Option<String>,
    pub name: Option<String>,
    pub distance: f64,
    pub elevation_gain: f64,
    pub duration: f64,
}

/// Identity of a stored activity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityKey {
    pub source: Source,
    pub source_id: String,
}

impl fmt::Display for ActivityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.source_id)
    }
}

/// Canonical, source-agnostic activity as held by the activity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub source_id: String,
    pub source: Source,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_local: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub raw_type: String,
    pub canonical_type: String,
    pub group: String,
    /// Meters.
    pub distance: f64,
    /// Meters.
    pub elevation_gain: f64,
    /// Seconds.
    pub duration: f64,
    #[serde(default)]
    pub deleted: bool,
}

impl Activity {
    pub fn key(&self) -> ActivityKey {
        ActivityKey {
            source: self.source,
            source_id: self.source_id.clone(),
        }
    }

    /// Calendar day the activity is bucketed into.
    pub fn day(&self, boundary: config::DayBoundary) -> NaiveDate {
        match (boundary, self.start_time_local) {
            (config::DayBoundary::Local, Some(local)) => local.date(),
            _ => self.start_time.date_naive(),
        }
    }
}

/// Persisted backfill progress for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillCursor {
    pub source: Source,
    pub oldest_fetched_boundary: Option<DateTime<Utc>>,
    pub page_token: Option<String>,
    pub complete: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope_fingerprint: Option<String>,
    #[serde(default)]
    pub rate_limited: bool,
}

impl BackfillCursor {
    pub fn fresh(source: Source) -> Self {
        Self {
            source,
            oldest_fetched_boundary: None,
            page_token: None,
            complete: false,
            last_run_at: None,
            scope_fingerprint: None,
            rate_limited: false,
        }
    }

    /// Record a merged page. The boundary only ever moves toward the past.
    pub fn advance(&mut self, page_oldest: Option<DateTime<Utc>>, next_token: Option<String>) {
        if let Some(oldest) = page_oldest {
            self.oldest_fetched_boundary = Some(match self.oldest_fetched_boundary {
                Some(current) => current.min(oldest),
                None => oldest,
            });
        }
        self.page_token = next_token;
    }

    /// Terminal state; the boundary is clamped to the lower bound when one applies.
    pub fn mark_complete(&mut self, lower_bound: Option<DateTime<Utc>>) {
        self.complete = true;
        self.page_token = None;
        if lower_bound.is_some() {
            self.oldest_fetched_boundary = lower_bound;
        }
    }
}

/// One equal-width slice of a heatmap day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapSegment {
    pub group: String,
    pub count: u32,
    pub duration: f64,
    pub distance: f64,
    pub elevation_gain: f64,
    /// Share of the day cell; `1 / number of groups that day`.
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapDay {
    pub date: NaiveDate,
    pub segments: Vec<HeatmapSegment>,
}

impl HeatmapDay {
    pub fn activity_count(&self) -> u32 {
        self.segments.iter().map(|s| s.count).sum()
    }
}

/// Stable, non-reversible identifier for a credential, used to notice when a
/// source is pointed at a different account.
pub fn credential_fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.trim().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
