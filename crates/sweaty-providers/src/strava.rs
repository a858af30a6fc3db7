//! Strava REST client: refresh-token auth, `before`-anchored backward paging.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sweaty_core::{credential_fingerprint, RawActivity, Source};
use sweaty_storage::{FetchedResponse, HttpFetcher, RateLimiter};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    json_f64, json_id, json_items, json_str, Page, ProviderClient, ProviderError,
    DEFAULT_RATE_LIMIT_WAIT,
};

const SHORT_WINDOW_SECS: i64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct StravaCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
pub struct StravaEndpoints {
    pub api_base: String,
    pub token_url: String,
}

impl Default for StravaEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://www.strava.com/api/v3".to_string(),
            token_url: "https://www.strava.com/oauth/token".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct StravaClient {
    http: HttpFetcher,
    limiter: RateLimiter,
    endpoints: StravaEndpoints,
    credentials: StravaCredentials,
    per_page: u32,
    access_token: Mutex<Option<String>>,
}

impl StravaClient {
    pub fn new(
        http: HttpFetcher,
        limiter: RateLimiter,
        endpoints: StravaEndpoints,
        credentials: StravaCredentials,
        per_page: u32,
    ) -> Self {
        Self {
            http,
            limiter,
            endpoints,
            credentials,
            per_page: per_page.max(1),
            access_token: Mutex::new(None),
        }
    }

    /// Exchange the refresh token once per process; later calls reuse it.
    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut guard = self.access_token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }

        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", self.credentials.refresh_token.as_str()),
        ];
        let request = self.http.client().post(&self.endpoints.token_url).form(&params);
        let response = match self.http.execute(Source::Strava.as_str(), request).await {
            Ok(response) => response,
            Err(sweaty_storage::FetchError::HttpStatus { status, body, .. })
                if (400..500).contains(&status) && status != 429 =>
            {
                return Err(ProviderError::AuthExpired(format!(
                    "token refresh rejected with status {status}: {body}"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let token: TokenResponse = response
            .json()
            .map_err(|err| ProviderError::Fatal(format!("parsing token response: {err}")))?;

        info!("strava access token refreshed");
        *guard = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn get_activities(&self, query: &[(&str, String)]) -> Result<Vec<JsonValue>, ProviderError> {
        let token = self.access_token().await?;
        self.limiter.acquire().await?;

        let url = format!(
            "{}/athlete/activities",
            self.endpoints.api_base.trim_end_matches('/')
        );
        let request = self.http.client().get(url).bearer_auth(token).query(query);
        let result = self.http.execute(Source::Strava.as_str(), request).await;

        match result {
            Ok(response) => {
                self.observe_headers(&response.headers).await;
                decode_body(&response)
            }
            Err(sweaty_storage::FetchError::HttpStatus {
                status: 429,
                retry_after,
                ..
            }) => Err(ProviderError::RateLimited {
                retry_after: retry_after.unwrap_or_else(|| until_next_window(Utc::now())),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn observe_headers(&self, headers: &HeaderMap) {
        if let Some((short, long)) = parse_usage(headers) {
            debug!(short, long, "strava usage reported");
            self.limiter.observe_usage(Some(short), Some(long)).await;
        }
    }
}

#[async_trait]
impl ProviderClient for StravaClient {
    fn source(&self) -> Source {
        Source::Strava
    }

    fn account_fingerprint(&self) -> Option<String> {
        Some(credential_fingerprint(&[
            &self.credentials.client_id,
            &self.credentials.refresh_token,
        ]))
    }

    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Page, ProviderError> {
        let mut out = Page::default();
        let mut page = 1u32;
        loop {
            let items = self
                .get_activities(&[
                    ("after", since.timestamp().to_string()),
                    ("page", page.to_string()),
                    ("per_page", self.per_page.to_string()),
                ])
                .await?;
            let full = items.len() >= self.per_page as usize;
            let (records, malformed) = decode_activities(items);
            out.records.extend(records);
            out.malformed += malformed;
            if !full {
                break;
            }
            page += 1;
        }
        out.records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(out)
    }

    async fn fetch_page(&self, token: Option<&str>) -> Result<Page, ProviderError> {
        let before = match token {
            Some(raw) => Some(raw.trim().parse::<i64>().map_err(|_| {
                ProviderError::Fatal(format!("invalid strava page token '{raw}'"))
            })?),
            None => None,
        };

        let mut query = vec![
            ("page", "1".to_string()),
            ("per_page", self.per_page.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        let items = self.get_activities(&query).await?;
        let exhausted = items.len() < self.per_page as usize;
        // taken over raw items so a page of undecodable records still advances
        let oldest = items.iter().filter_map(item_start).min();
        let (mut records, malformed) = decode_activities(items);
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let next_token = match (exhausted, oldest) {
            (true, _) => None,
            (false, Some(oldest)) => Some(next_before(oldest.timestamp(), before).to_string()),
            (false, None) => {
                return Err(ProviderError::Fatal(
                    "full strava page without a readable start_date; cannot page further"
                        .to_string(),
                ))
            }
        };
        Ok(Page {
            records,
            next_token,
            malformed,
        })
    }
}

/// `before` for the next page. One second past the oldest start so records
/// sharing that second are refetched rather than skipped; when that would
/// repeat the current request, step onto the oldest second itself.
fn next_before(oldest_epoch: i64, current_before: Option<i64>) -> i64 {
    let candidate = oldest_epoch + 1;
    match current_before {
        Some(current) if candidate >= current => oldest_epoch,
        _ => candidate,
    }
}

/// Seconds until the next quarter-hour, when Strava's short window resets.
fn until_next_window(now: DateTime<Utc>) -> std::time::Duration {
    let into_window = now.timestamp().rem_euclid(SHORT_WINDOW_SECS);
    let secs = (SHORT_WINDOW_SECS - into_window).max(1) as u64;
    std::time::Duration::from_secs(secs).min(DEFAULT_RATE_LIMIT_WAIT)
}

/// `X-RateLimit-Usage: <15min>,<daily>`.
fn parse_usage(headers: &HeaderMap) -> Option<(u32, u32)> {
    let raw = headers.get("x-ratelimit-usage")?.to_str().ok()?;
    let (short, long) = raw.split_once(',')?;
    Some((short.trim().parse().ok()?, long.trim().parse().ok()?))
}

fn decode_body(response: &FetchedResponse) -> Result<Vec<JsonValue>, ProviderError> {
    let body: JsonValue = response
        .json()
        .map_err(|err| ProviderError::Fatal(format!("decoding strava activities: {err}")))?;
    Ok(json_items(body, "activities"))
}

/// Decode a page of summary activities, skipping records without id or start.
pub fn decode_activities(items: Vec<JsonValue>) -> (Vec<RawActivity>, usize) {
    let mut malformed = 0;
    let records = items
        .iter()
        .filter_map(|item| {
            let decoded = decode_activity(item);
            if decoded.is_none() {
                malformed += 1;
                warn!(item = %item, "skipping malformed strava activity");
            }
            decoded
        })
        .collect();
    (records, malformed)
}

fn decode_activity(item: &JsonValue) -> Option<RawActivity> {
    let source_id = json_id(item, &["id"])?;
    let start_time = item_start(item)?;
    // start_date_local carries a misleading `Z`; it is wall-clock time.
    let start_time_local = json_str(item, &["start_date_local"]).and_then(parse_wall_clock);

    let moving = json_f64(item, &["moving_time"]).unwrap_or(0.0);
    let elapsed = json_f64(item, &["elapsed_time"]).unwrap_or(0.0);

    Some(RawActivity {
        source: Source::Strava,
        source_id,
        start_time,
        start_time_local,
        sport_type: json_str(item, &["sport_type"]).map(str::to_string),
        activity_type: json_str(item, &["type"]).map(str::to_string),
        name: json_str(item, &["name"]).map(str::to_string),
        distance: json_f64(item, &["distance"]).unwrap_or(0.0),
        elevation_gain: json_f64(item, &["total_elevation_gain"]).unwrap_or(0.0),
        duration: if moving > 0.0 { moving } else { elapsed.max(0.0) },
    })
}

fn item_start(item: &JsonValue) -> Option<DateTime<Utc>> {
    json_str(item, &["start_date"])
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_wall_clock(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S").ok()
}
