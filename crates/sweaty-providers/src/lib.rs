//! Provider clients: one interchangeable implementation per activity source.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sweaty_core::config::Config;
use sweaty_core::{RawActivity, Source};
use sweaty_storage::{BudgetExhausted, FetchError, HttpFetcher, RateLimiter, RetryDisposition};
use thiserror::Error;

pub mod garmin;
pub mod strava;

pub use garmin::{GarminClient, GarminEndpoints};
pub use strava::{StravaClient, StravaCredentials, StravaEndpoints};

pub const CRATE_NAME: &str = "sweaty-providers";

/// Fallback wait when a provider rejects a call for rate reasons without
/// saying for how long.
pub const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited, retry in {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("authorization expired or missing: {0}")]
    AuthExpired(String),
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Map a raw HTTP failure into the taxonomy the orchestrator acts on.
    pub fn from_fetch(err: FetchError) -> Self {
        match &err {
            FetchError::HttpStatus {
                status,
                retry_after,
                body,
                ..
            } => match *status {
                401 | 403 => ProviderError::AuthExpired(err.to_string()),
                429 => ProviderError::RateLimited {
                    retry_after: retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT),
                },
                _ if body.to_ascii_lowercase().contains("rate limit") => {
                    ProviderError::RateLimited {
                        retry_after: retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT),
                    }
                }
                _ => match err.disposition() {
                    RetryDisposition::Retryable => ProviderError::Transient(err.to_string()),
                    RetryDisposition::NonRetryable => ProviderError::Fatal(err.to_string()),
                },
            },
            FetchError::Request(_) => match err.disposition() {
                RetryDisposition::Retryable => ProviderError::Transient(err.to_string()),
                RetryDisposition::NonRetryable => ProviderError::Fatal(err.to_string()),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<BudgetExhausted> for ProviderError {
    fn from(err: BudgetExhausted) -> Self {
        ProviderError::RateLimited {
            retry_after: err.retry_after,
        }
    }
}

impl From<FetchError> for ProviderError {
    fn from(err: FetchError) -> Self {
        ProviderError::from_fetch(err)
    }
}

/// One response worth of decoded records, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawActivity>,
    /// Token for the next older page; `None` once history is exhausted.
    pub next_token: Option<String>,
    /// Records skipped at decode because they had no id or start time.
    pub malformed: usize,
}

impl Page {
    pub fn oldest_start(&self) -> Option<DateTime<Utc>> {
        self.records.iter().map(|r| r.start_time).min()
    }
}

/// Capability set every source implements.
///
/// `fetch_page(None)` starts at the newest activity; each returned token
/// points strictly further into the past.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn source(&self) -> Source;

    /// Fingerprint of the account the credentials belong to, when known.
    /// A change between runs means the stored history is someone else's.
    fn account_fingerprint(&self) -> Option<String> {
        None
    }

    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Page, ProviderError>;

    async fn fetch_page(&self, token: Option<&str>) -> Result<Page, ProviderError>;
}

/// Secrets handed over by the external auth setup. Never prompted for.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub strava: Option<StravaCredentials>,
    pub garmin_access_token: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let strava = match (
            non_empty_env("STRAVA_CLIENT_ID"),
            non_empty_env("STRAVA_CLIENT_SECRET"),
            non_empty_env("STRAVA_REFRESH_TOKEN"),
        ) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => {
                Some(StravaCredentials {
                    client_id,
                    client_secret,
                    refresh_token,
                })
            }
            _ => None,
        };
        Self {
            strava,
            garmin_access_token: non_empty_env("GARMIN_ACCESS_TOKEN"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Build the client for `config.source` with its rate-limit policy applied.
pub fn build_provider(
    config: &Config,
    credentials: &Credentials,
    http: HttpFetcher,
) -> Result<Box<dyn ProviderClient>, ProviderError> {
    let limiter = RateLimiter::new(config.rate_limits.policy(config.source));
    let per_page = config.sync.per_page;
    match config.source {
        Source::Strava => {
            let creds = credentials.strava.clone().ok_or_else(|| {
                ProviderError::AuthExpired(
                    "STRAVA_CLIENT_ID, STRAVA_CLIENT_SECRET and STRAVA_REFRESH_TOKEN must be set"
                        .to_string(),
                )
            })?;
            Ok(Box::new(StravaClient::new(
                http,
                limiter,
                StravaEndpoints::default(),
                creds,
                per_page,
            )))
        }
        Source::Garmin => Ok(Box::new(GarminClient::new(
            http,
            limiter,
            GarminEndpoints::default(),
            credentials.garmin_access_token.clone(),
            config.garmin.strict_token_only,
            per_page,
        )?)),
    }
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

pub(crate) fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    match cur {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ids arrive as numbers from both providers, occasionally as strings.
pub(crate) fn json_id(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key)? {
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

/// The response body may be a bare array or wrap it under `key`.
pub(crate) fn json_items(body: JsonValue, key: &str) -> Vec<JsonValue> {
    match body {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove(key) {
            Some(JsonValue::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status_error(status: u16, body: &str) -> FetchError {
        FetchError::HttpStatus {
            status,
            url: "http://provider.test/x".into(),
            retry_after: None,
            body: body.into(),
        }
    }

    #[test]
    fn http_failures_map_onto_the_taxonomy() {
        assert!(matches!(
            ProviderError::from_fetch(status_error(401, "")),
            ProviderError::AuthExpired(_)
        ));
        assert!(matches!(
            ProviderError::from_fetch(status_error(429, "")),
            ProviderError::RateLimited { retry_after } if retry_after == DEFAULT_RATE_LIMIT_WAIT
        ));
        assert!(matches!(
            ProviderError::from_fetch(status_error(400, "Rate Limit Exceeded")),
            ProviderError::RateLimited { .. }
        ));
        assert!(ProviderError::from_fetch(status_error(503, "")).is_transient());
        assert!(matches!(
            ProviderError::from_fetch(status_error(404, "gone")),
            ProviderError::Fatal(_)
        ));
    }

    #[test]
    fn budget_exhaustion_is_a_rate_limit() {
        let err: ProviderError = BudgetExhausted {
            retry_after: Duration::from_secs(42),
        }
        .into();
        assert!(matches!(
            err,
            ProviderError::RateLimited { retry_after } if retry_after.as_secs() == 42
        ));
    }

    #[test]
    fn json_helpers_accept_loose_shapes() {
        let value = json!({"id": 17, "alt": " 9 ", "nested": {"d": "12.5"}, "empty": ""});
        assert_eq!(json_id(&value, &["missing", "id"]).as_deref(), Some("17"));
        assert_eq!(json_id(&value, &["alt"]).as_deref(), Some("9"));
        assert_eq!(json_f64(&value, &["nested", "d"]), Some(12.5));
        assert_eq!(json_str(&value, &["empty"]), None);

        assert_eq!(json_items(json!([1, 2]), "activities").len(), 2);
        assert_eq!(json_items(json!({"activities": [1]}), "activities").len(), 1);
        assert!(json_items(json!({"other": 1}), "activities").is_empty());
    }
}
