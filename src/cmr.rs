use std::collections::VecDeque;
use std::error::Error as StdError;
use std::io;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{
    BoundingBox, CollectionId, GranuleDetail, GranuleRecord, TemporalRange, flatten_manifest,
    parse_utc_timestamp,
};
use crate::error::AuditError;

pub const SEARCH_AFTER_HEADER: &str = "CMR-Search-After";
pub const MAX_PAGE_SIZE: usize = 2000;

const UMM_RESULTS_JSON: &str = "application/vnd.nasa.cmr.umm_results+json";
const UMM_JSON: &str = "application/vnd.nasa.cmr.umm+json";

/// Exponential backoff: `base * 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no sleeping.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the `retry`-th failed attempt (0-based).
    pub fn delay_for(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Outcome of a single attempt inside [`with_retries`].
#[derive(Debug)]
pub enum AttemptError {
    Transient(String),
    Fatal(AuditError),
}

/// Runs `op` until it succeeds, fails fatally, or the attempt budget is spent.
/// Backoff state lives on this call's stack only.
pub fn with_retries<T, F>(policy: &RetryPolicy, endpoint: &str, mut op: F) -> Result<T, AuditError>
where
    F: FnMut(usize) -> Result<T, AttemptError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Transient(message)) => {
                if attempt >= max_attempts {
                    return Err(AuditError::RetriesExhausted {
                        endpoint: endpoint.to_string(),
                        attempts: attempt,
                        last_error: message,
                    });
                }
                let delay = policy.delay_for(attempt - 1);
                warn!(
                    endpoint,
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    error = %message,
                    "backing off after transient CMR failure"
                );
                thread::sleep(delay);
            }
        }
    }
}

/// Minimum spacing between consecutive requests of one client.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut last = self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pagination {
    #[default]
    SearchAfter,
    PageNumber,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub throttle: Duration,
    pub retry: RetryPolicy,
    pub pagination: Pagination,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cmr.earthdata.nasa.gov".to_string(),
            timeout: Duration::from_secs(60),
            throttle: Duration::ZERO,
            retry: RetryPolicy::default(),
            pagination: Pagination::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub collection: CollectionId,
    pub temporal: TemporalRange,
    pub bounding_box: Option<BoundingBox>,
    pub page_size: usize,
    pub max_pages: usize,
}

impl SearchQuery {
    pub fn new(
        collection: CollectionId,
        temporal: TemporalRange,
        page_size: usize,
        max_pages: usize,
    ) -> Result<Self, AuditError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(AuditError::InvalidPageSize(page_size));
        }
        Ok(Self {
            collection,
            temporal,
            bounding_box: None,
            page_size,
            max_pages,
        })
    }

    pub fn with_bounding_box(mut self, bounding_box: BoundingBox) -> Self {
        self.bounding_box = Some(bounding_box);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based.
    pub page_num: usize,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub records: Vec<GranuleRecord>,
    pub hits: Option<u64>,
    pub cursor: Option<String>,
    /// Set by sources that know no further page exists regardless of size.
    pub exhausted: bool,
}

pub trait MetadataSource: Send + Sync {
    fn fetch_page(&self, query: &SearchQuery, request: &PageRequest) -> Result<Page, AuditError>;
    fn fetch_detail(&self, concept_id: &str) -> Result<GranuleDetail, AuditError>;

    /// Lazy granule sequence. Every call re-issues the query from page one.
    fn search(&self, query: SearchQuery) -> GranuleSearch<'_, Self>
    where
        Self: Sized,
    {
        GranuleSearch::new(self, query)
    }
}

/// Iterator over every granule a query returns, fetching pages on demand.
pub struct GranuleSearch<'a, S: MetadataSource + ?Sized> {
    source: &'a S,
    query: SearchQuery,
    buffer: VecDeque<GranuleRecord>,
    cursor: Option<String>,
    pages_fetched: usize,
    done: bool,
}

impl<'a, S: MetadataSource + ?Sized> GranuleSearch<'a, S> {
    pub fn new(source: &'a S, query: SearchQuery) -> Self {
        Self {
            source,
            query,
            buffer: VecDeque::new(),
            cursor: None,
            pages_fetched: 0,
            done: false,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    fn fetch_next_page(&mut self) -> Result<(), AuditError> {
        let request = PageRequest {
            page_num: self.pages_fetched + 1,
            cursor: self.cursor.take(),
        };
        let page = self.source.fetch_page(&self.query, &request)?;
        self.pages_fetched += 1;
        debug!(
            collection = %self.query.collection,
            page = self.pages_fetched,
            records = page.records.len(),
            hits = ?page.hits,
            "fetched CMR page"
        );

        let short = page.records.len() < self.query.page_size;
        if short || page.exhausted {
            self.done = true;
        } else if self.pages_fetched >= self.query.max_pages {
            warn!(
                collection = %self.query.collection,
                max_pages = self.query.max_pages,
                "max_pages reached before the result set ended"
            );
            self.done = true;
        }
        self.cursor = page.cursor;
        self.buffer.extend(page.records);
        Ok(())
    }
}

impl<S: MetadataSource + ?Sized> Iterator for GranuleSearch<'_, S> {
    type Item = Result<GranuleRecord, AuditError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.done || self.pages_fetched >= self.query.max_pages {
                return None;
            }
            if let Err(err) = self.fetch_next_page() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}

struct JsonResponse {
    body: Value,
    search_after: Option<String>,
}

pub struct CmrHttpClient {
    client: Client,
    config: ClientConfig,
    throttle: Throttle,
}

impl CmrHttpClient {
    pub fn new(config: ClientConfig) -> Result<Self, AuditError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("opera-audit/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AuditError::CmrHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|err| AuditError::CmrHttp(err.to_string()))?;
        Ok(Self {
            client,
            throttle: Throttle::new(config.throttle),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn search_url(&self) -> String {
        format!(
            "{}/search/granules.umm_json",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn concept_url(&self, concept_id: &str) -> String {
        format!(
            "{}/search/concepts/{}.umm_json",
            self.config.base_url.trim_end_matches('/'),
            concept_id
        )
    }

    fn fetch_json<F>(&self, endpoint: &str, make_req: F) -> Result<JsonResponse, AuditError>
    where
        F: Fn() -> reqwest::blocking::RequestBuilder,
    {
        with_retries(&self.config.retry, endpoint, |attempt| {
            self.throttle.wait();
            debug!(endpoint, attempt, "sending CMR request");
            let response = match make_req().send() {
                Ok(response) => response,
                Err(err) if is_retryable_error(&err) => {
                    return Err(AttemptError::Transient(err.to_string()));
                }
                Err(err) => return Err(AttemptError::Fatal(AuditError::CmrHttp(err.to_string()))),
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                if is_retryable_status(status) {
                    return Err(AttemptError::Transient(format!("status {status}")));
                }
                let message = response
                    .text()
                    .map(|text| text.chars().take(300).collect())
                    .unwrap_or_else(|_| "CMR request failed".to_string());
                return Err(AttemptError::Fatal(AuditError::CmrStatus {
                    status,
                    endpoint: endpoint.to_string(),
                    message,
                }));
            }

            let search_after = response
                .headers()
                .get(SEARCH_AFTER_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string());
            match response.json::<Value>() {
                Ok(body) => Ok(JsonResponse { body, search_after }),
                Err(err) if err.is_decode() => Err(AttemptError::Fatal(AuditError::CmrDecode {
                    endpoint: endpoint.to_string(),
                    message: err.to_string(),
                })),
                Err(err) if is_retryable_error(&err) => {
                    Err(AttemptError::Transient(err.to_string()))
                }
                Err(err) => Err(AttemptError::Fatal(AuditError::CmrHttp(err.to_string()))),
            }
        })
    }
}

impl MetadataSource for CmrHttpClient {
    fn fetch_page(&self, query: &SearchQuery, request: &PageRequest) -> Result<Page, AuditError> {
        let url = self.search_url();
        let mut params = vec![
            ("collection_concept_id", query.collection.as_str().to_string()),
            ("temporal[]", query.temporal.to_cmr_param()),
            ("page_size", query.page_size.to_string()),
        ];
        if let Some(bbox) = &query.bounding_box {
            params.push(("bounding_box", bbox.to_cmr_param()));
        }
        if self.config.pagination == Pagination::PageNumber {
            params.push(("page_num", request.page_num.to_string()));
        }

        let response = self.fetch_json(&url, || {
            let mut builder = self
                .client
                .get(&url)
                .query(&params)
                .header(ACCEPT, UMM_RESULTS_JSON);
            if let (Pagination::SearchAfter, Some(cursor)) =
                (self.config.pagination, request.cursor.as_deref())
            {
                builder = builder.header(SEARCH_AFTER_HEADER, cursor);
            }
            builder
        })?;

        let (records, hits) =
            parse_search_page(&response.body).map_err(|message| AuditError::CmrDecode {
                endpoint: url.clone(),
                message,
            })?;
        let exhausted =
            self.config.pagination == Pagination::SearchAfter && response.search_after.is_none();
        Ok(Page {
            records,
            hits,
            cursor: response.search_after,
            exhausted,
        })
    }

    fn fetch_detail(&self, concept_id: &str) -> Result<GranuleDetail, AuditError> {
        let concept_id = concept_id.trim();
        if concept_id.is_empty() || concept_id.contains('/') {
            return Err(AuditError::InvalidConceptId(concept_id.to_string()));
        }
        let url = self.concept_url(concept_id);
        let response = self.fetch_json(&url, || self.client.get(&url).header(ACCEPT, UMM_JSON))?;
        Ok(detail_from_umm(concept_id, &response.body))
    }
}

/// Decodes a `granules.umm_json` page into records and the reported hit count.
pub fn parse_search_page(body: &Value) -> Result<(Vec<GranuleRecord>, Option<u64>), String> {
    let items = body
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "response has no `items` array".to_string())?;
    let hits = body.get("hits").and_then(|v| v.as_u64());
    Ok((items.iter().map(granule_from_umm_item).collect(), hits))
}

pub fn granule_from_umm_item(item: &Value) -> GranuleRecord {
    let meta = item.get("meta");
    let umm = item.get("umm").unwrap_or(&Value::Null);
    let concept_id = meta
        .and_then(|v| v.get("concept-id"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let native_id = umm
        .get("GranuleUR")
        .and_then(|v| v.as_str())
        .or_else(|| meta.and_then(|v| v.get("native-id")).and_then(|v| v.as_str()))
        .unwrap_or(&concept_id)
        .to_string();

    let temporal = umm.get("TemporalExtent");
    let range = temporal.and_then(|v| v.get("RangeDateTime"));
    let single = temporal
        .and_then(|v| v.get("SingleDateTime"))
        .and_then(|v| v.as_str())
        .and_then(parse_utc_timestamp);
    let temporal_start = range
        .and_then(|v| v.get("BeginningDateTime"))
        .and_then(|v| v.as_str())
        .and_then(parse_utc_timestamp)
        .or(single);
    let temporal_end = range
        .and_then(|v| v.get("EndingDateTime"))
        .and_then(|v| v.as_str())
        .and_then(parse_utc_timestamp)
        .or(single);

    let bounding_box = umm
        .get("SpatialExtent")
        .and_then(|v| v.get("HorizontalSpatialDomain"))
        .and_then(|v| v.get("Geometry"))
        .and_then(|v| v.get("BoundingRectangles"))
        .and_then(|v| v.as_array())
        .and_then(|rects| rects.first())
        .and_then(|rect| {
            let coord = |key: &str| rect.get(key).and_then(|v| v.as_f64());
            BoundingBox::new(
                coord("WestBoundingCoordinate")?,
                coord("SouthBoundingCoordinate")?,
                coord("EastBoundingCoordinate")?,
                coord("NorthBoundingCoordinate")?,
            )
            .ok()
        });

    let platforms = umm
        .get("Platforms")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|p| p.get("ShortName").and_then(|v| v.as_str()))
                .map(|name| name.to_string())
                .collect()
        })
        .unwrap_or_default();
    let input_granules = umm
        .get("InputGranules")
        .and_then(flatten_manifest)
        .unwrap_or_default();

    GranuleRecord {
        native_id,
        concept_id,
        temporal_start,
        temporal_end,
        bounding_box,
        platforms,
        input_granules,
    }
}

pub fn detail_from_umm(concept_id: &str, umm: &Value) -> GranuleDetail {
    GranuleDetail {
        concept_id: concept_id.to_string(),
        native_id: umm
            .get("GranuleUR")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string()),
        input_manifest: umm.get("InputGranules").and_then(flatten_manifest),
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Timeouts, refused connections, interrupted bodies and connections reset
/// mid-request.
fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || is_connection_reset(err)
}

fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            );
        }
        source = inner.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn default_backoff_schedule() {
        let policy = RetryPolicy::default();
        let delays = (0..5).map(|n| policy.delay_for(n).as_secs()).collect::<Vec<_>>();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);
    }

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "request failed: {}", self.0)
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn connection_resets_are_found_in_the_source_chain() {
        let reset = Wrapped(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(is_connection_reset(&reset));
        let denied = Wrapped(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!is_connection_reset(&denied));
    }

    #[test]
    fn zero_throttle_does_not_block() {
        let throttle = Throttle::new(Duration::ZERO);
        let started = Instant::now();
        for _ in 0..100 {
            throttle.wait();
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn throttle_spaces_consecutive_requests() {
        let interval = Duration::from_millis(40);
        let throttle = Throttle::new(interval);
        let started = Instant::now();
        throttle.wait();
        throttle.wait();
        assert!(started.elapsed() >= interval);
        throttle.wait();
        assert!(started.elapsed() >= interval * 2);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn transient_failures_exhaust_budget() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(&RetryPolicy::immediate(5), "search", |_| {
            calls += 1;
            Err(AttemptError::Transient("status 503".to_string()))
        });
        assert_eq!(calls, 5);
        assert_matches!(
            result,
            Err(AuditError::RetriesExhausted { attempts: 5, ref endpoint, .. }) if endpoint == "search"
        );
    }

    #[test]
    fn fatal_failure_is_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_retries(&RetryPolicy::immediate(5), "search", |_| {
            calls += 1;
            Err(AttemptError::Fatal(AuditError::CmrStatus {
                status: 400,
                endpoint: "search".to_string(),
                message: "bad temporal".to_string(),
            }))
        });
        assert_eq!(calls, 1);
        assert!(result.unwrap_err().is_caller_error());
    }

    #[test]
    fn recovers_after_transient_failure() {
        let result = with_retries(&RetryPolicy::immediate(5), "search", |attempt| {
            if attempt < 3 {
                Err(AttemptError::Transient("connection reset".to_string()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }
}
