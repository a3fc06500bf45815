//! External source boundary: the retrying fetcher, the ranked-listing and
//! metric-history provider contracts, and the session credential capability.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chartwatch_core::{ItemId, UsageSample};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "chartwatch-source";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Connect/timeout class; retried with attempt-scaled backoff.
    Retryable,
    /// Source-reported rate-limit or unavailable; retried with the longer
    /// fixed throttle delay.
    Throttled,
    NonRetryable,
}

pub fn classify_status(status: reqwest::StatusCode) -> RetryDisposition {
    use reqwest::StatusCode;
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        RetryDisposition::Throttled
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub throttle_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            throttle_delay: Duration::from_secs(3),
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

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("attempts exhausted ({attempts}) for {url}")]
    AttemptsExhausted { attempts: usize, url: String },
    #[error("malformed payload from {url}: {detail}")]
    MalformedPayload { url: String, detail: String },
    #[error("session credential unavailable: {0}")]
    Session(String),
}

/// Process-wide credential capability with an explicit refresh lifecycle,
/// injected into the fetcher instead of living in a bare mutable global.
#[async_trait]
pub trait SessionCredential: Send + Sync {
    async fn acquire(&self) -> Result<String, FetchError>;
    async fn is_expiring(&self) -> bool;
    async fn refresh(&self) -> Result<(), FetchError>;
}

/// Static API-key session: never expires, refresh is a no-op.
#[derive(Debug)]
pub struct ApiKeySession {
    key: RwLock<String>,
}

impl ApiKeySession {
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: RwLock::new(key.into()),
        })
    }
}

#[async_trait]
impl SessionCredential for ApiKeySession {
    async fn acquire(&self) -> Result<String, FetchError> {
        Ok(self.key.read().await.clone())
    }

    async fn is_expiring(&self) -> bool {
        false
    }

    async fn refresh(&self) -> Result<(), FetchError> {
        Ok(())
    }
}

/// Periodic refresh task, independent of the scrape cycle. Returns the
/// join handle so the caller owns shutdown.
pub fn spawn_session_refresh(
    session: Arc<dyn SessionCredential>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if session.is_expiring().await {
                if let Err(err) = session.refresh().await {
                    warn!(error = %err, "session refresh failed");
                }
            }
        }
    })
}

/// Issues one logical GET-for-JSON request with bounded retry. The reqwest
/// client timeout is the hard per-attempt ceiling; an in-flight call is
/// aborted when it fires.
#[derive(Clone)]
pub struct RetryingFetcher {
    client: reqwest::Client,
    policy: BackoffPolicy,
    session: Option<Arc<dyn SessionCredential>>,
}

impl RetryingFetcher {
    pub fn new(
        timeout: Duration,
        user_agent: &str,
        policy: BackoffPolicy,
        session: Option<Arc<dyn SessionCredential>>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .context("building reqwest client for source fetcher")?;
        Ok(Self {
            client,
            policy,
            session,
        })
    }

    pub async fn fetch_json(&self, url: &str, query: &[(String, String)]) -> Result<Value, FetchError> {
        let span = info_span!("source_fetch", url);
        self.fetch_json_inner(url, query).instrument(span).await
    }

    async fn fetch_json_inner(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Value, FetchError> {
        let mut query = query.to_vec();
        if let Some(session) = &self.session {
            query.push(("key".to_string(), session.acquire().await?));
        }

        for attempt in 0..self.policy.max_attempts {
            let last_attempt = attempt + 1 == self.policy.max_attempts;
            let result = self.client.get(url).query(&query).send().await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        // A garbled body (truncated mid-throttle, half a
                        // payload) burns an attempt like any transient
                        // failure instead of killing the page outright.
                        match resp.json::<Value>().await {
                            Ok(payload) => return Ok(payload),
                            Err(err) if last_attempt => return Err(FetchError::Request(err)),
                            Err(err) => {
                                warn!(attempt, error = %err, "body decode failed, retrying");
                                tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
                                continue;
                            }
                        }
                    }
                    match classify_status(status) {
                        RetryDisposition::Throttled if !last_attempt => {
                            warn!(status = status.as_u16(), attempt, "source throttled, backing off");
                            tokio::time::sleep(self.policy.throttle_delay).await;
                        }
                        RetryDisposition::Retryable if !last_attempt => {
                            tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
                        }
                        RetryDisposition::NonRetryable => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: url.to_string(),
                            });
                        }
                        _ => {}
                    }
                }
                Err(err) => match classify_request_error(&err) {
                    RetryDisposition::NonRetryable => return Err(FetchError::Request(err)),
                    _ if last_attempt => {}
                    _ => tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await,
                },
            }
        }

        Err(FetchError::AttemptsExhausted {
            attempts: self.policy.max_attempts,
            url: url.to_string(),
        })
    }
}

/// Ranked-listing collaborator: one page of item ids for one market, in
/// rank order. An empty page signals end of pagination.
#[async_trait]
pub trait RankedListingProvider: Send + Sync {
    async fn fetch_page(
        &self,
        market: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ItemId>, FetchError>;
}

/// One cursor-paginated slice of an item's metric history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricPage {
    pub samples: Vec<UsageSample>,
    pub next_cursor: Option<String>,
}

/// Metric-history collaborator: pagination continues until the cursor
/// comes back `None`.
#[async_trait]
pub trait MetricHistoryProvider: Send + Sync {
    async fn fetch_history(
        &self,
        item_id: ItemId,
        cursor: Option<&str>,
    ) -> Result<MetricPage, FetchError>;
}

/// JSON store-query listing provider.
pub struct HttpListingProvider {
    fetcher: RetryingFetcher,
    base_url: String,
}

impl HttpListingProvider {
    pub fn new(fetcher: RetryingFetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RankedListingProvider for HttpListingProvider {
    async fn fetch_page(
        &self,
        market: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<ItemId>, FetchError> {
        // Listing pages are 1-based.
        let start = page.saturating_sub(1) * page_size;
        let input = serde_json::json!({
            "query": {
                "start": start,
                "count": page_size,
                "sort": 11,
                "filters": { "regional_top_n_sellers": page_size },
            },
            "context": { "language": "en", "country_code": market.to_uppercase() },
        });
        let query = vec![("input_json".to_string(), input.to_string())];
        let payload = self.fetcher.fetch_json(&self.base_url, &query).await?;
        Ok(parse_listing_items(&payload))
    }
}

/// Pulls item ids out of a listing payload, dropping anything without a
/// usable non-zero id.
pub fn parse_listing_items(payload: &Value) -> Vec<ItemId> {
    payload
        .pointer("/response/store_items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.get("appid")
                        .or_else(|| item.get("id"))
                        .and_then(Value::as_u64)
                })
                .filter(|id| *id > 0)
                .map(|id| id as ItemId)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct MetricHistoryPayload {
    #[serde(default)]
    history: Vec<MetricHistoryEntry>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetricHistoryEntry {
    item_id: ItemId,
    captured_ts: i64,
    value: i64,
}

/// JSON metric-history provider with cursor pagination.
pub struct HttpMetricProvider {
    fetcher: RetryingFetcher,
    base_url: String,
}

impl HttpMetricProvider {
    pub fn new(fetcher: RetryingFetcher, base_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl MetricHistoryProvider for HttpMetricProvider {
    async fn fetch_history(
        &self,
        item_id: ItemId,
        cursor: Option<&str>,
    ) -> Result<MetricPage, FetchError> {
        let mut query = vec![("item_id".to_string(), item_id.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor".to_string(), cursor.to_string()));
        }
        let payload = self.fetcher.fetch_json(&self.base_url, &query).await?;
        parse_metric_page(&self.base_url, item_id, payload)
    }
}

pub fn parse_metric_page(
    url: &str,
    item_id: ItemId,
    payload: Value,
) -> Result<MetricPage, FetchError> {
    let parsed: MetricHistoryPayload =
        serde_json::from_value(payload).map_err(|err| FetchError::MalformedPayload {
            url: url.to_string(),
            detail: err.to_string(),
        })?;
    let samples = parsed
        .history
        .into_iter()
        .filter(|entry| entry.item_id == item_id && entry.item_id > 0)
        .map(|entry| UsageSample {
            item_id: entry.item_id,
            captured_ts: entry.captured_ts,
            value: entry.value,
        })
        .collect();
    Ok(MetricPage {
        samples,
        next_cursor: parsed.next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            throttle_delay: Duration::from_secs(3),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttle_statuses_are_classified_apart_from_server_errors() {
        use reqwest::StatusCode;
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Throttled
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Throttled
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn listing_items_keep_rank_order_and_drop_zero_ids() {
        let payload = json!({
            "response": {
                "store_items": [
                    { "appid": 730 },
                    { "id": 570 },
                    { "appid": 0 },
                    { "name": "no id at all" },
                    { "appid": 440 },
                ]
            }
        });
        assert_eq!(parse_listing_items(&payload), vec![730, 570, 440]);
    }

    #[test]
    fn listing_payload_without_items_is_empty_not_error() {
        assert!(parse_listing_items(&json!({ "response": {} })).is_empty());
        assert!(parse_listing_items(&json!({})).is_empty());
    }

    #[test]
    fn metric_page_parses_history_and_cursor() {
        let payload = json!({
            "history": [
                { "item_id": 730, "captured_ts": 1000, "value": 55 },
                { "item_id": 730, "captured_ts": 1600, "value": 62 },
            ],
            "next_cursor": "p2",
        });
        let page = parse_metric_page("http://x", 730, payload).expect("parse");
        assert_eq!(page.samples.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("p2"));
        assert_eq!(
            page.samples[1],
            UsageSample {
                item_id: 730,
                captured_ts: 1600,
                value: 62
            }
        );
    }

    #[test]
    fn metric_page_with_null_cursor_ends_pagination() {
        let payload = json!({ "history": [], "next_cursor": null });
        let page = parse_metric_page("http://x", 730, payload).expect("parse");
        assert!(page.samples.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn malformed_metric_payload_is_a_typed_error() {
        let payload = json!({ "history": "not-an-array" });
        let err = parse_metric_page("http://x", 730, payload).expect_err("must fail");
        assert!(matches!(err, FetchError::MalformedPayload { .. }));
    }

    // One response per accepted connection, then the listener goes away.
    fn serve_bodies(bodies: Vec<&'static str>) -> std::net::SocketAddr {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            for body in bodies {
                let (mut stream, _) = listener.accept().expect("accept");
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(resp.as_bytes()).expect("write response");
            }
        });
        addr
    }

    #[tokio::test]
    async fn garbled_success_body_is_retried_not_fatal() {
        let addr = serve_bodies(vec!["not json at all", "{\"ok\": true}"]);
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            throttle_delay: Duration::from_millis(1),
        };
        let fetcher = RetryingFetcher::new(Duration::from_secs(5), "chartwatch-test", policy, None)
            .expect("fetcher");

        let payload = fetcher
            .fetch_json(&format!("http://{addr}/"), &[])
            .await
            .expect("second attempt has a clean body");
        assert_eq!(payload["ok"], true);
    }

    #[tokio::test]
    async fn api_key_session_round_trips_and_never_expires() {
        let session = ApiKeySession::new("k-123");
        assert_eq!(session.acquire().await.expect("acquire"), "k-123");
        assert!(!session.is_expiring().await);
        session.refresh().await.expect("refresh is a no-op");
    }

    #[tokio::test]
    async fn session_refresh_task_stops_on_abort() {
        let session = ApiKeySession::new("k-123");
        let handle = spawn_session_refresh(session, Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();
        let err = handle.await.expect_err("aborted task");
        assert!(err.is_cancelled());
    }
}
