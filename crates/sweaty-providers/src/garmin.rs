//! Garmin Connect client: session-token access, offset paging anchored on a
//! local end date.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use sweaty_core::{credential_fingerprint, RawActivity, Source};
use sweaty_storage::{HttpFetcher, RateLimiter};
use tracing::{debug, warn};

use crate::{json_f64, json_id, json_items, json_str, Page, ProviderClient, ProviderError};

const SEARCH_PATH: &str = "activitylist-service/activities/search/activities";
const DETAIL_PATH: &str = "activity-service/activity";
const MAX_RECENT_PAGES: usize = 20;

#[derive(Debug, Clone)]
pub struct GarminEndpoints {
    pub api_base: String,
}

impl Default for GarminEndpoints {
    fn default() -> Self {
        Self {
            api_base: "https://connectapi.garmin.com".to_string(),
        }
    }
}

/// Resume position: `offset` records into the listing that ends at
/// `end_date` (inclusive, local calendar). Encoded as `<end_date>:<offset>`,
/// `latest:<offset>` before any anchor exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarminPageToken {
    pub end_date: Option<NaiveDate>,
    pub offset: u32,
}

impl fmt::Display for GarminPageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end_date {
            Some(date) => write!(f, "{}:{}", date.format("%Y-%m-%d"), self.offset),
            None => write!(f, "latest:{}", self.offset),
        }
    }
}

impl FromStr for GarminPageToken {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProviderError::Fatal(format!("invalid garmin page token '{s}'"));
        let (date, offset) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let offset = offset.parse::<u32>().map_err(|_| invalid())?;
        let end_date = match date {
            "latest" | "" => None,
            other => Some(NaiveDate::parse_from_str(other, "%Y-%m-%d").map_err(|_| invalid())?),
        };
        Ok(Self { end_date, offset })
    }
}

impl GarminPageToken {
    /// Re-anchor on the oldest local date of the page so the token stays
    /// valid even if newer activities are uploaded between runs.
    fn next(&self, records: &[RawActivity], raw_len: usize, per_page: u32) -> Option<Self> {
        if raw_len < per_page as usize {
            return None;
        }
        let raw_len = u32::try_from(raw_len).unwrap_or(u32::MAX);
        let Some(oldest) = records.iter().map(local_date).min() else {
            return Some(Self {
                end_date: self.end_date,
                offset: self.offset.saturating_add(raw_len),
            });
        };
        if self.end_date == Some(oldest) {
            return Some(Self {
                end_date: self.end_date,
                offset: self.offset.saturating_add(raw_len),
            });
        }
        let on_oldest = records.iter().filter(|r| local_date(r) == oldest).count();
        Some(Self {
            end_date: Some(oldest),
            offset: u32::try_from(on_oldest).unwrap_or(u32::MAX),
        })
    }
}

fn local_date(record: &RawActivity) -> NaiveDate {
    record
        .start_time_local
        .map(|t| t.date())
        .unwrap_or_else(|| record.start_time.date_naive())
}

pub struct GarminClient {
    http: HttpFetcher,
    limiter: RateLimiter,
    endpoints: GarminEndpoints,
    access_token: Option<String>,
    per_page: u32,
}

impl GarminClient {
    /// In strict token mode a missing token is refused up front instead of
    /// surfacing as an auth failure on the first request.
    pub fn new(
        http: HttpFetcher,
        limiter: RateLimiter,
        endpoints: GarminEndpoints,
        access_token: Option<String>,
        strict_token_only: bool,
        per_page: u32,
    ) -> Result<Self, ProviderError> {
        if access_token.is_none() {
            if strict_token_only {
                return Err(ProviderError::AuthExpired(
                    "garmin strict token-only mode is enabled but GARMIN_ACCESS_TOKEN is not set"
                        .to_string(),
                ));
            }
            warn!("no garmin access token configured; requests will be rejected");
        }
        Ok(Self {
            http,
            limiter,
            endpoints,
            access_token,
            per_page: per_page.max(1),
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<JsonValue, ProviderError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| ProviderError::AuthExpired("no garmin session token".to_string()))?;
        self.limiter.acquire().await?;

        let url = format!("{}/{}", self.endpoints.api_base.trim_end_matches('/'), path);
        let request = self
            .http
            .client()
            .get(url)
            .bearer_auth(token)
            .header("DI-Backend", "connectapi.garmin.com")
            .query(query);
        let response = self.http.execute(Source::Garmin.as_str(), request).await?;
        response
            .json()
            .map_err(|err| ProviderError::Fatal(format!("decoding garmin response: {err}")))
    }

    async fn search(&self, token: &GarminPageToken) -> Result<Vec<JsonValue>, ProviderError> {
        let mut query = vec![
            ("start", token.offset.to_string()),
            ("limit", self.per_page.to_string()),
        ];
        if let Some(end) = token.end_date {
            query.push(("endDate", end.format("%Y-%m-%d").to_string()));
        }
        let body = self.get_json(SEARCH_PATH, &query).await?;
        Ok(json_items(body, "activities"))
    }

    /// Listing entries sometimes carry no usable duration; the detail
    /// endpoint usually does. Failures leave the record as it was.
    async fn enrich_durations(&self, records: &mut [RawActivity]) {
        for record in records.iter_mut().filter(|r| r.duration <= 0.0) {
            let path = format!("{DETAIL_PATH}/{}", record.source_id);
            match self.get_json(&path, &[]).await {
                Ok(detail) => {
                    let duration = pick_duration(&detail);
                    if duration > 0.0 {
                        debug!(id = %record.source_id, duration, "duration enriched");
                        record.duration = duration;
                    }
                }
                Err(err) => {
                    debug!(id = %record.source_id, error = %err, "duration enrichment failed");
                }
            }
        }
    }
}

#[async_trait]
impl ProviderClient for GarminClient {
    fn source(&self) -> Source {
        Source::Garmin
    }

    fn account_fingerprint(&self) -> Option<String> {
        self.access_token
            .as_deref()
            .map(|token| credential_fingerprint(&[token]))
    }

    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Page, ProviderError> {
        let mut out = Page::default();
        let mut token = GarminPageToken::default();
        for _ in 0..MAX_RECENT_PAGES {
            let items = self.search(&token).await?;
            let raw_len = items.len();
            let (records, malformed) = decode_activities(items);
            out.malformed += malformed;

            let next = token.next(&records, raw_len, self.per_page);
            let reached_since = records.iter().any(|r| r.start_time < since);
            out.records
                .extend(records.into_iter().filter(|r| r.start_time >= since));
            match next {
                Some(next) if !reached_since => token = next,
                _ => break,
            }
        }
        self.enrich_durations(&mut out.records).await;
        Ok(out)
    }

    async fn fetch_page(&self, token: Option<&str>) -> Result<Page, ProviderError> {
        let current = match token {
            Some(raw) => raw.parse::<GarminPageToken>()?,
            None => GarminPageToken::default(),
        };
        let items = self.search(&current).await?;
        let raw_len = items.len();
        let (mut records, malformed) = decode_activities(items);
        self.enrich_durations(&mut records).await;

        let next_token = current
            .next(&records, raw_len, self.per_page)
            .map(|next| next.to_string());
        Ok(Page {
            records,
            next_token,
            malformed,
        })
    }
}

/// Decode a listing page, skipping records without id or start time.
pub fn decode_activities(items: Vec<JsonValue>) -> (Vec<RawActivity>, usize) {
    let mut malformed = 0;
    let records = items
        .iter()
        .filter_map(|item| {
            let decoded = decode_activity(item);
            if decoded.is_none() {
                malformed += 1;
                warn!(item = %item, "skipping malformed garmin activity");
            }
            decoded
        })
        .collect();
    (records, malformed)
}

fn decode_activity(item: &JsonValue) -> Option<RawActivity> {
    let source_id = json_id(item, &["activityId", "id"])?;
    let start_time_local = first_str(item, &[&["startTimeLocal"], &["startDate"]])
        .and_then(parse_garmin_time);
    // GMT is authoritative; some exports only carry the local stamp.
    let start_time = first_str(item, &[&["startTimeGMT"], &["startTimeGmt"]])
        .and_then(parse_garmin_time)
        .or(start_time_local)?
        .and_utc();

    Some(RawActivity {
        source: Source::Garmin,
        source_id,
        start_time,
        start_time_local,
        sport_type: type_key(item),
        activity_type: None,
        name: first_str(item, &[&["activityName"], &["name"], &["summaryDTO", "activityName"]])
            .map(str::to_string),
        distance: first_f64(item, &[&["distance"], &["totalDistance"]]).unwrap_or(0.0),
        elevation_gain: first_f64(item, &[&["elevationGain"], &["totalElevationGain"]])
            .unwrap_or(0.0),
        duration: pick_duration(item),
    })
}

fn type_key(item: &JsonValue) -> Option<String> {
    first_str(
        item,
        &[
            &["activityType", "typeKey"],
            &["activityTypeDTO", "typeKey"],
            &["activityType", "type"],
            &["type"],
            &["activityType"],
        ],
    )
    .map(str::to_string)
}

/// First positive duration among the known fields, else the first numeric
/// one, else zero.
fn pick_duration(item: &JsonValue) -> f64 {
    const CANDIDATES: &[&[&str]] = &[
        &["movingDuration"],
        &["duration"],
        &["elapsedDuration"],
        &["summaryDTO", "movingDuration"],
        &["summaryDTO", "duration"],
        &["summaryDTO", "elapsedDuration"],
        &["activitySummary", "movingDuration"],
        &["activitySummary", "duration"],
        &["activitySummary", "elapsedDuration"],
    ];
    let mut first_numeric = None;
    for path in CANDIDATES {
        let Some(value) = json_f64(item, path) else {
            continue;
        };
        if value > 0.0 {
            return value;
        }
        first_numeric.get_or_insert(value);
    }
    first_numeric.unwrap_or(0.0).max(0.0)
}

fn first_str<'a>(item: &'a JsonValue, paths: &[&[&str]]) -> Option<&'a str> {
    paths.iter().find_map(|path| json_str(item, path))
}

fn first_f64(item: &JsonValue, paths: &[&[&str]]) -> Option<f64> {
    paths.iter().find_map(|path| json_f64(item, path))
}

fn parse_garmin_time(raw: &str) -> Option<NaiveDateTime> {
    let normalized = raw.trim().replace('T', " ");
    let trimmed = normalized.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use serde_json::json;
    use sweaty_storage::HttpClientConfig;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture_page() -> JsonValue {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/garmin/activities_page.json");
        let text = std::fs::read_to_string(path).expect("read fixture");
        serde_json::from_str(&text).expect("parse fixture")
    }

    fn client(server: &MockServer, per_page: u32) -> GarminClient {
        GarminClient::new(
            HttpFetcher::new(HttpClientConfig::default()).expect("http"),
            RateLimiter::unconstrained(),
            GarminEndpoints {
                api_base: server.uri(),
            },
            Some("session-token".into()),
            true,
            per_page,
        )
        .expect("client")
    }

    async fn mount_detail(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/activity-service/activity/15000000003"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "activityId": 15000000003u64,
                "summaryDTO": { "movingDuration": null, "duration": 4500.0 }
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn fixture_decodes_with_duration_fallbacks() {
        let (records, malformed) = decode_activities(json_items(fixture_page(), "activities"));
        assert_eq!(records.len(), 3);
        assert_eq!(malformed, 1);

        assert_eq!(records[0].source_id, "15000000004");
        assert_eq!(records[0].sport_type.as_deref(), Some("running"));
        assert_eq!(records[0].duration, 2400.5);
        assert_eq!(
            records[0].start_time.to_rfc3339(),
            "2024-05-04T14:10:00+00:00"
        );
        assert_eq!(records[1].duration, 0.0);
        assert_eq!(records[2].duration, 3600.0);
    }

    #[test]
    fn page_tokens_round_trip_and_reject_garbage() {
        let token: GarminPageToken = "2024-05-03:2".parse().expect("token");
        assert_eq!(token.end_date, NaiveDate::from_ymd_opt(2024, 5, 3));
        assert_eq!(token.offset, 2);
        assert_eq!(token.to_string(), "2024-05-03:2");
        assert_eq!(GarminPageToken::default().to_string(), "latest:0");
        assert!("yesterday".parse::<GarminPageToken>().is_err());
        assert!("2024-13-01:4".parse::<GarminPageToken>().is_err());
    }

    #[test]
    fn strict_mode_requires_a_token() {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("http");
        let strict = GarminClient::new(
            http.clone(),
            RateLimiter::unconstrained(),
            GarminEndpoints::default(),
            None,
            true,
            50,
        );
        assert!(matches!(strict, Err(ProviderError::AuthExpired(_))));

        let lenient = GarminClient::new(
            http,
            RateLimiter::unconstrained(),
            GarminEndpoints::default(),
            None,
            false,
            50,
        )
        .expect("lenient client");
        assert_eq!(lenient.account_fingerprint(), None);
    }

    #[tokio::test]
    async fn first_page_reanchors_on_oldest_local_date() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activitylist-service/activities/search/activities"))
            .and(query_param("start", "0"))
            .and(query_param("limit", "4"))
            .and(header("authorization", "Bearer session-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture_page()))
            .mount(&server)
            .await;
        mount_detail(&server).await;

        let garmin = client(&server, 4);
        let page = garmin.fetch_page(None).await.expect("page");
        assert_eq!(page.records.len(), 3);
        assert_eq!(page.malformed, 1);
        assert_eq!(page.records[1].duration, 4500.0);
        // two activities fall on 2024-05-03, the oldest local day of the page
        assert_eq!(page.next_token.as_deref(), Some("2024-05-03:2"));
    }

    #[tokio::test]
    async fn same_day_page_advances_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activitylist-service/activities/search/activities"))
            .and(query_param("start", "2"))
            .and(query_param("endDate", "2024-05-03"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                fixture_page()[1].clone(),
                fixture_page()[2].clone(),
            ])))
            .mount(&server)
            .await;
        mount_detail(&server).await;

        let garmin = client(&server, 2);
        let page = garmin.fetch_page(Some("2024-05-03:2")).await.expect("page");
        assert_eq!(page.next_token.as_deref(), Some("2024-05-03:4"));
    }

    #[tokio::test]
    async fn short_page_ends_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activitylist-service/activities/search/activities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture_page()))
            .mount(&server)
            .await;
        mount_detail(&server).await;

        let garmin = client(&server, 100);
        let page = garmin.fetch_page(None).await.expect("page");
        assert!(page.next_token.is_none());
    }

    #[tokio::test]
    async fn recent_window_stops_at_since() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activitylist-service/activities/search/activities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(fixture_page()))
            .expect(1)
            .mount(&server)
            .await;
        mount_detail(&server).await;

        let garmin = client(&server, 4);
        let since = NaiveDate::from_ymd_opt(2024, 5, 4)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let page = garmin.fetch_recent(since).await.expect("recent");
        let ids: Vec<&str> = page.records.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["15000000004", "15000000003"]);
        assert_eq!(page.records[1].duration, 4500.0);
    }

    #[tokio::test]
    async fn auth_and_rate_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/activitylist-service/activities/search/activities"))
            .and(query_param("start", "0"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/activitylist-service/activities/search/activities"))
            .and(query_param("start", "7"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
            .mount(&server)
            .await;

        let garmin = client(&server, 4);
        assert!(matches!(
            garmin.fetch_page(None).await,
            Err(ProviderError::AuthExpired(_))
        ));
        match garmin.fetch_page(Some("2024-01-01:7")).await {
            Err(ProviderError::RateLimited { retry_after }) => {
                assert_eq!(retry_after.as_secs(), 120);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }
}
