//! Resolved configuration consumed by the sync engine.
//!
//! Every field has a default so a sparse `config.yaml` deserializes into a
//! complete tree. Reading and merging files is the loader's job, not this
//! module's.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::units::{DistanceUnit, ElevationUnit};
use crate::Source;

pub const DEFAULT_OTHER_BUCKET: &str = "OtherSports";
pub const MAX_PER_PAGE: u32 = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sync.per_page must be between 1 and {MAX_PER_PAGE}, got {0}")]
    InvalidPerPage(u32),
    #[error("activities.other_bucket must not be empty")]
    EmptyOtherBucket,
    #[error("rate_limits.{provider}.{field} must be greater than zero")]
    InvalidRateWindow {
        provider: Source,
        field: &'static str,
    },
    #[error("sync.start_date {0} is in the future")]
    StartDateInFuture(NaiveDate),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: Source,
    pub sync: SyncSettings,
    pub activities: ActivitySettings,
    pub units: UnitSettings,
    pub rate_limits: RateLimitSettings,
    pub garmin: GarminSettings,
    pub heatmaps: HeatmapSettings,
}

impl Config {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ConfigError> {
        if self.sync.per_page == 0 || self.sync.per_page > MAX_PER_PAGE {
            return Err(ConfigError::InvalidPerPage(self.sync.per_page));
        }
        if self.activities.other_bucket.trim().is_empty() {
            return Err(ConfigError::EmptyOtherBucket);
        }
        if let Some(start) = self.sync.start_date {
            if start > now.date_naive() {
                return Err(ConfigError::StartDateInFuture(start));
            }
        }
        for source in Source::ALL {
            self.rate_limits.overrides(source).check(source)?;
        }
        Ok(())
    }

    /// Hash of everything that decides which activities a backfill keeps.
    ///
    /// Units and rate limits are not part of it: changing them must never
    /// force a re-fetch.
    pub fn scope_fingerprint(&self) -> String {
        let mut types: Vec<&str> = self.activities.types.iter().map(String::as_str).collect();
        types.sort_unstable();
        types.dedup();
        let mut exclude: Vec<&str> = self
            .activities
            .exclude_types
            .iter()
            .map(String::as_str)
            .collect();
        exclude.sort_unstable();
        exclude.dedup();

        let scope = serde_json::json!({
            "start_date": self.sync.start_date,
            "lookback_years": self.sync.lookback_years,
            "types": types,
            "include_all_types": self.activities.include_all_types,
            "exclude_types": exclude,
            "group_other_types": self.activities.group_other_types,
            "other_bucket": self.activities.other_bucket,
            "group_aliases": self.activities.group_aliases,
            "type_aliases": self.activities.type_aliases,
        });
        let mut hasher = Sha256::new();
        hasher.update(scope.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub start_date: Option<NaiveDate>,
    pub lookback_years: Option<u32>,
    pub recent_days: u32,
    pub resume_backfill: bool,
    pub prune_deleted: bool,
    pub per_page: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            start_date: None,
            lookback_years: None,
            recent_days: 7,
            resume_backfill: true,
            prune_deleted: false,
            per_page: MAX_PER_PAGE,
        }
    }
}

impl SyncSettings {
    /// Oldest instant the backfill has to reach; `None` means full history.
    pub fn lower_bound(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(start) = self.start_date {
            return Some(start.and_time(NaiveTime::MIN).and_utc());
        }
        let years = self.lookback_years?;
        now.checked_sub_months(Months::new(years.saturating_mul(12)))
    }

    pub fn recent_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.recent_days))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitySettings {
    /// Featured groups/types. Empty means every resolved group is featured.
    pub types: Vec<String>,
    pub include_all_types: bool,
    pub exclude_types: Vec<String>,
    pub group_other_types: bool,
    pub other_bucket: String,
    pub group_aliases: BTreeMap<String, String>,
    pub type_aliases: BTreeMap<String, String>,
}

impl Default for ActivitySettings {
    fn default() -> Self {
        Self {
            types: Vec::new(),
            include_all_types: true,
            exclude_types: Vec::new(),
            group_other_types: true,
            other_bucket: DEFAULT_OTHER_BUCKET.to_string(),
            group_aliases: BTreeMap::new(),
            type_aliases: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitSettings {
    pub distance: DistanceUnit,
    pub elevation: ElevationUnit,
}

/// Sparse per-provider overrides as written in `rate_limits.<source>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitOverrides {
    pub unconstrained: Option<bool>,
    pub short_window_requests: Option<u32>,
    pub short_window_secs: Option<u64>,
    pub long_window_requests: Option<u32>,
    pub long_window_secs: Option<u64>,
    pub max_wait_secs: Option<u64>,
}

impl RateLimitOverrides {
    fn check(&self, provider: Source) -> Result<(), ConfigError> {
        let fields = [
            ("short_window_requests", self.short_window_requests.map(u64::from)),
            ("short_window_secs", self.short_window_secs),
            ("long_window_requests", self.long_window_requests.map(u64::from)),
            ("long_window_secs", self.long_window_secs),
        ];
        for (field, value) in fields {
            if value == Some(0) {
                return Err(ConfigError::InvalidRateWindow { provider, field });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub strava: RateLimitOverrides,
    pub garmin: RateLimitOverrides,
}

impl RateLimitSettings {
    pub fn overrides(&self, source: Source) -> &RateLimitOverrides {
        match source {
            Source::Strava => &self.strava,
            Source::Garmin => &self.garmin,
        }
    }

    /// Provider default with the user's overrides applied on top.
    pub fn policy(&self, source: Source) -> RateLimitPolicy {
        RateLimitPolicy::provider_default(source).with_overrides(self.overrides(source))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBudget {
    pub requests: u32,
    pub period: Duration,
}

/// Resolved request budget for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub short: Option<WindowBudget>,
    pub long: Option<WindowBudget>,
    /// Longest sleep the limiter may take before stopping the run instead.
    pub max_wait: Duration,
}

impl RateLimitPolicy {
    pub fn unconstrained() -> Self {
        Self {
            short: None,
            long: None,
            max_wait: Duration::ZERO,
        }
    }

    /// Strava's read budget (100 per 15 minutes, 1000 per day); Garmin is
    /// session based and has no published budget.
    pub fn provider_default(source: Source) -> Self {
        match source {
            Source::Strava => Self {
                short: Some(WindowBudget {
                    requests: 100,
                    period: Duration::from_secs(15 * 60),
                }),
                long: Some(WindowBudget {
                    requests: 1000,
                    period: Duration::from_secs(24 * 60 * 60),
                }),
                max_wait: Duration::from_secs(60),
            },
            Source::Garmin => Self::unconstrained(),
        }
    }

    pub fn is_unconstrained(&self) -> bool {
        self.short.is_none() && self.long.is_none()
    }

    fn with_overrides(mut self, o: &RateLimitOverrides) -> Self {
        if o.unconstrained == Some(true) {
            return Self {
                max_wait: o.max_wait_secs.map(Duration::from_secs).unwrap_or(self.max_wait),
                ..Self::unconstrained()
            };
        }
        self.short = merge_window(self.short, o.short_window_requests, o.short_window_secs, 15 * 60);
        self.long = merge_window(self.long, o.long_window_requests, o.long_window_secs, 24 * 60 * 60);
        if let Some(secs) = o.max_wait_secs {
            self.max_wait = Duration::from_secs(secs);
        }
        self
    }
}

fn merge_window(
    base: Option<WindowBudget>,
    requests: Option<u32>,
    secs: Option<u64>,
    fallback_secs: u64,
) -> Option<WindowBudget> {
    match (base, requests, secs) {
        (base, None, None) => base,
        (Some(b), requests, secs) => Some(WindowBudget {
            requests: requests.unwrap_or(b.requests),
            period: secs.map(Duration::from_secs).unwrap_or(b.period),
        }),
        (None, Some(requests), secs) => Some(WindowBudget {
            requests,
            period: Duration::from_secs(secs.unwrap_or(fallback_secs)),
        }),
        (None, None, Some(_)) => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GarminSettings {
    pub strict_token_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayBoundary {
    /// Provider-reported local start time, UTC when absent.
    #[default]
    Local,
    Utc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapSettings {
    pub day_boundary: DayBoundary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 29, 10, 0, 0).single().unwrap()
    }

    #[test]
    fn sparse_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str(
            "source: garmin\nsync:\n  recent_days: 3\nactivities:\n  exclude_types: [Yoga]\n",
        )
        .unwrap();
        assert_eq!(config.source, Source::Garmin);
        assert_eq!(config.sync.recent_days, 3);
        assert!(config.sync.resume_backfill);
        assert_eq!(config.sync.per_page, 200);
        assert_eq!(config.activities.exclude_types, vec!["Yoga".to_string()]);
        assert_eq!(config.activities.other_bucket, "OtherSports");
        assert_eq!(config.units.distance, DistanceUnit::Mi);
        assert!(config.validate(now()).is_ok());
    }

    #[test]
    fn lower_bound_prefers_start_date() {
        let mut sync = SyncSettings {
            lookback_years: Some(2),
            ..SyncSettings::default()
        };
        assert_eq!(
            sync.lower_bound(now()),
            Some(Utc.with_ymd_and_hms(2022, 2, 28, 10, 0, 0).single().unwrap())
        );

        sync.start_date = NaiveDate::from_ymd_opt(2020, 6, 1);
        assert_eq!(
            sync.lower_bound(now()),
            Some(Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).single().unwrap())
        );

        assert_eq!(SyncSettings::default().lower_bound(now()), None);
    }

    #[test]
    fn rate_limit_policy_is_per_provider() {
        let settings = RateLimitSettings::default();
        assert!(settings.policy(Source::Garmin).is_unconstrained());

        let strava = settings.policy(Source::Strava);
        assert_eq!(strava.short.unwrap().requests, 100);
        assert_eq!(strava.long.unwrap().period, Duration::from_secs(86_400));

        let tuned: RateLimitSettings = serde_yaml::from_str(
            "strava:\n  short_window_requests: 40\n  max_wait_secs: 0\ngarmin:\n  short_window_requests: 10\n",
        )
        .unwrap();
        let strava = tuned.policy(Source::Strava);
        assert_eq!(strava.short.unwrap().requests, 40);
        assert_eq!(strava.short.unwrap().period, Duration::from_secs(900));
        assert_eq!(strava.max_wait, Duration::ZERO);
        let garmin = tuned.policy(Source::Garmin);
        assert_eq!(garmin.short.unwrap().requests, 10);
        assert!(garmin.long.is_none());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.sync.per_page = 500;
        assert_eq!(config.validate(now()), Err(ConfigError::InvalidPerPage(500)));

        let mut config = Config::default();
        config.rate_limits.strava.long_window_secs = Some(0);
        assert!(matches!(
            config.validate(now()),
            Err(ConfigError::InvalidRateWindow { field: "long_window_secs", .. })
        ));

        let mut config = Config::default();
        config.sync.start_date = NaiveDate::from_ymd_opt(2030, 1, 1);
        assert!(matches!(
            config.validate(now()),
            Err(ConfigError::StartDateInFuture(_))
        ));
    }

    #[test]
    fn fingerprint_ignores_units_and_list_order() {
        let mut a = Config::default();
        a.activities.types = vec!["Run".into(), "Ride".into()];
        let mut b = a.clone();
        b.activities.types = vec!["Ride".into(), "Run".into()];
        b.units.distance = DistanceUnit::Km;
        assert_eq!(a.scope_fingerprint(), b.scope_fingerprint());

        b.activities.exclude_types = vec!["Yoga".into()];
        assert_ne!(a.scope_fingerprint(), b.scope_fingerprint());
    }
}
