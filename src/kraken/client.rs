// =============================================================================
// Kraken REST API Client — public market data + signed private calls
// =============================================================================
//
// Every call goes through `request`, which paces, retries transport failures
// with exponential backoff and unwraps Kraken's `{error, result}` envelope.
// Exchange-level errors are never retried: Kraken answered, and the answer
// will not change by asking again.
//
// SECURITY: private calls are signed by `RequestSigner`; the secret is never
// logged. A retried private call is re-signed so every attempt carries a
// fresh nonce.
//
// `market_snapshot` answers from a per-pair TTL cache; everything else always
// goes to the exchange.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::{FeedError, FeedResult};
use crate::kraken::rate_limit::{PacerSnapshot, RequestPacer};
use crate::kraken::signer::{encode_form, Params, RequestSigner};
use crate::market_data::Candle;
use crate::runtime_config::RestConfig;
use crate::types::{BookDepth, Timeframe};

const USER_AGENT: &str = concat!("kraken-feed/", env!("CARGO_PKG_VERSION"));

// -----------------------------------------------------------------------------
// Endpoints
// -----------------------------------------------------------------------------

/// A Kraken REST endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Time,
    SystemStatus,
    Assets,
    AssetPairs,
    Ticker,
    Ohlc,
    Depth,
    Trades,
    Spread,
    /// Private method name, e.g. `Balance` → `/0/private/Balance`.
    Private(String),
}

impl Endpoint {
    pub fn path(&self) -> String {
        match self {
            Self::Time => "/0/public/Time".into(),
            Self::SystemStatus => "/0/public/SystemStatus".into(),
            Self::Assets => "/0/public/Assets".into(),
            Self::AssetPairs => "/0/public/AssetPairs".into(),
            Self::Ticker => "/0/public/Ticker".into(),
            Self::Ohlc => "/0/public/OHLC".into(),
            Self::Depth => "/0/public/Depth".into(),
            Self::Trades => "/0/public/Trades".into(),
            Self::Spread => "/0/public/Spread".into(),
            Self::Private(method) => format!("/0/private/{method}"),
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, Self::Private(_))
    }
}

// -----------------------------------------------------------------------------
// Retry policy
// -----------------------------------------------------------------------------

/// Retry budget for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    /// Sleep before the retry that follows failed attempt `attempt` (0-based):
    /// `2^attempt × backoff_unit`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_unit.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

// -----------------------------------------------------------------------------
// HTTP transport seam
// -----------------------------------------------------------------------------

/// Raw HTTP exchange. Implementations return the response body as text and
/// map every network-level failure (including non-2xx status) to
/// `FeedError::Transport`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &str, query: &[(String, String)]) -> FeedResult<String>;

    async fn post_form(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: String,
    ) -> FeedResult<String>;
}

/// Production transport over a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> FeedResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, query: &[(String, String)]) -> FeedResult<String> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }

    async fn post_form(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: String,
    ) -> FeedResult<String> {
        let mut req = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded; charset=utf-8");
        for (name, value) in headers {
            req = req.header(*name, value.as_str());
        }
        let resp = req.body(body).send().await?.error_for_status()?;
        Ok(resp.text().await?)
    }
}

// -----------------------------------------------------------------------------
// Typed results
// -----------------------------------------------------------------------------

/// One entry of `/0/public/AssetPairs`. Unused fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetPairInfo {
    #[serde(default)]
    pub altname: String,
    /// Stream pair name (`XBT/USD`). Absent for some legacy pairs.
    #[serde(default)]
    pub wsname: Option<String>,
    pub base: String,
    pub quote: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub pair_decimals: Option<u32>,
    #[serde(default)]
    pub lot_decimals: Option<u32>,
    #[serde(default)]
    pub ordermin: Option<String>,
}

/// Parsed `/0/public/OHLC` response.
#[derive(Debug, Clone, PartialEq)]
pub struct OhlcPage {
    /// Candles in the order Kraken returned them (oldest-first).
    pub candles: Vec<Candle>,
    /// Kraken's `last` cursor, usable as `since` for the next page.
    pub last: Option<i64>,
}

/// What the symbol resolver and timeline store need from the exchange.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn asset_pairs(&self) -> FeedResult<BTreeMap<String, AssetPairInfo>>;

    async fn ohlc(&self, pair: &str, interval: Timeframe, since: Option<i64>) -> FeedResult<OhlcPage>;
}

// =============================================================================
// Market snapshot cache
// =============================================================================

/// Ticker, the top 10 book levels and recent trades for one pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub pair: String,
    pub ticker: Value,
    pub order_book: Value,
    pub recent_trades: Value,
    pub fetched_at: DateTime<Utc>,
}

struct CachedSnapshot {
    stored_at: Instant,
    snapshot: MarketSnapshot,
}

impl CachedSnapshot {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() >= ttl
    }
}

struct SnapshotCache {
    ttl: RwLock<Duration>,
    entries: RwLock<HashMap<String, CachedSnapshot>>,
}

impl SnapshotCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl: RwLock::new(ttl),
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, pair: &str) -> Option<MarketSnapshot> {
        let ttl = *self.ttl.read();
        self.entries
            .read()
            .get(pair)
            .filter(|entry| !entry.is_expired(ttl))
            .map(|entry| entry.snapshot.clone())
    }

    fn put(&self, snapshot: MarketSnapshot) {
        self.entries.write().insert(
            snapshot.pair.clone(),
            CachedSnapshot {
                stored_at: Instant::now(),
                snapshot,
            },
        );
    }

    fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let dropped = entries.len();
        entries.clear();
        dropped
    }
}

// =============================================================================
// KrakenRestClient
// =============================================================================

/// Kraken REST client with pacing, retries and optional request signing.
#[derive(Clone)]
pub struct KrakenRestClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    signer: Option<Arc<RequestSigner>>,
    retry: RetryPolicy,
    pacer: Arc<RequestPacer>,
    cache: Arc<SnapshotCache>,
}

impl KrakenRestClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Build a client over a real `reqwest` transport.
    pub fn new(config: &RestConfig, signer: Option<RequestSigner>) -> FeedResult<Self> {
        let transport = ReqwestTransport::new(config.timeout())?;
        Ok(Self::with_transport(config, Arc::new(transport), signer))
    }

    /// Build a client over any transport.
    pub fn with_transport(
        config: &RestConfig,
        transport: Arc<dyn HttpTransport>,
        signer: Option<RequestSigner>,
    ) -> Self {
        debug!(
            base_url = %config.base_url,
            max_retries = config.max_retries,
            signed = signer.is_some(),
            "KrakenRestClient initialised"
        );
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            transport,
            signer: signer.map(Arc::new),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                backoff_unit: config.backoff_unit(),
            },
            pacer: Arc::new(RequestPacer::new(config.min_request_interval())),
            cache: Arc::new(SnapshotCache::new(config.snapshot_cache_ttl())),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn pacer_snapshot(&self) -> PacerSnapshot {
        self.pacer.snapshot()
    }

    // -------------------------------------------------------------------------
    // Core request path
    // -------------------------------------------------------------------------

    /// Call `endpoint` and return the `result` field of the response.
    ///
    /// Transport failures are retried up to `max_retries` times; every other
    /// error is returned immediately.
    pub async fn request(&self, endpoint: Endpoint, params: Params) -> FeedResult<Value> {
        let path = endpoint.path();
        let url = format!("{}{}", self.base_url, path);

        let mut attempt: u32 = 0;
        loop {
            self.pacer.acquire().await;
            debug!(path = %path, attempt = attempt + 1, "sending Kraken request");

            let outcome = match self.send_once(&endpoint, &path, &url, &params).await {
                Ok(body) => parse_envelope(&body),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let wait = self.retry.delay(attempt);
                    warn!(
                        path = %path,
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "request failed, retrying"
                    );
                    self.pacer.record_retry();
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.pacer.record_failure();
                    warn!(path = %path, attempts = attempt + 1, error = %e, "request failed");
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(
        &self,
        endpoint: &Endpoint,
        path: &str,
        url: &str,
        params: &Params,
    ) -> FeedResult<String> {
        if !endpoint.is_private() {
            return self.transport.get(url, params).await;
        }

        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| FeedError::Auth("private endpoint called without credentials".into()))?;
        let mut signed = params.clone();
        let headers = signer.sign(path, &mut signed)?;
        self.transport
            .post_form(url, &headers.pairs(), encode_form(&signed))
            .await
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /0/public/Time.
    #[instrument(skip(self), name = "kraken::server_time")]
    pub async fn server_time(&self) -> FeedResult<Value> {
        self.request(Endpoint::Time, Params::new()).await
    }

    /// GET /0/public/SystemStatus.
    #[instrument(skip(self), name = "kraken::system_status")]
    pub async fn system_status(&self) -> FeedResult<Value> {
        self.request(Endpoint::SystemStatus, Params::new()).await
    }

    /// GET /0/public/Assets, optionally filtered to `assets`.
    #[instrument(skip(self), name = "kraken::assets")]
    pub async fn assets(&self, assets: &[&str]) -> FeedResult<Value> {
        let mut params = vec![("aclass".to_string(), "currency".to_string())];
        if !assets.is_empty() {
            params.push(("asset".to_string(), assets.join(",")));
        }
        let result = self.request(Endpoint::Assets, params).await?;
        info!(count = object_len(&result), "retrieved asset info");
        Ok(result)
    }

    /// GET /0/public/AssetPairs: every tradeable pair, keyed by pair id.
    #[instrument(skip(self), name = "kraken::asset_pairs")]
    pub async fn asset_pairs(&self) -> FeedResult<BTreeMap<String, AssetPairInfo>> {
        let params = vec![("info".to_string(), "info".to_string())];
        let result = self.request(Endpoint::AssetPairs, params).await?;
        let pairs: BTreeMap<String, AssetPairInfo> = serde_json::from_value(result)
            .map_err(|e| FeedError::MalformedResponse(format!("AssetPairs: {e}")))?;
        info!(count = pairs.len(), "retrieved trading pairs");
        Ok(pairs)
    }

    /// GET /0/public/Ticker for `pairs` (all pairs when empty).
    #[instrument(skip(self), name = "kraken::ticker")]
    pub async fn ticker(&self, pairs: &[&str]) -> FeedResult<Value> {
        let mut params = Params::new();
        if !pairs.is_empty() {
            params.push(("pair".to_string(), pairs.join(",")));
        }
        self.request(Endpoint::Ticker, params).await
    }

    /// GET /0/public/OHLC.
    ///
    /// Row layout: `[time, open, high, low, close, vwap, volume, count]`, with
    /// prices and volume as strings.
    #[instrument(skip(self), name = "kraken::ohlc")]
    pub async fn ohlc(&self, pair: &str, interval: Timeframe, since: Option<i64>) -> FeedResult<OhlcPage> {
        let mut params = vec![
            ("pair".to_string(), pair.to_string()),
            ("interval".to_string(), interval.minutes().to_string()),
        ];
        if let Some(since) = since {
            params.push(("since".to_string(), since.to_string()));
        }

        let result = self.request(Endpoint::Ohlc, params).await?;
        let page = parse_ohlc_result(pair, &result)?;
        info!(pair, interval = %interval, count = page.candles.len(), "retrieved OHLC candles");
        Ok(page)
    }

    /// GET /0/public/Depth.
    #[instrument(skip(self), name = "kraken::order_book")]
    pub async fn order_book(&self, pair: &str, depth: BookDepth) -> FeedResult<Value> {
        let params = vec![
            ("pair".to_string(), pair.to_string()),
            ("count".to_string(), depth.get().to_string()),
        ];
        self.request(Endpoint::Depth, params).await
    }

    /// GET /0/public/Trades.
    #[instrument(skip(self), name = "kraken::recent_trades")]
    pub async fn recent_trades(
        &self,
        pair: &str,
        since: Option<i64>,
        count: Option<u32>,
    ) -> FeedResult<Value> {
        let mut params = vec![("pair".to_string(), pair.to_string())];
        if let Some(since) = since {
            params.push(("since".to_string(), since.to_string()));
        }
        if let Some(count) = count {
            params.push(("count".to_string(), count.to_string()));
        }
        self.request(Endpoint::Trades, params).await
    }

    /// GET /0/public/Spread.
    #[instrument(skip(self), name = "kraken::recent_spreads")]
    pub async fn recent_spreads(&self, pair: &str, since: Option<i64>) -> FeedResult<Value> {
        let mut params = vec![("pair".to_string(), pair.to_string())];
        if let Some(since) = since {
            params.push(("since".to_string(), since.to_string()));
        }
        self.request(Endpoint::Spread, params).await
    }

    // -------------------------------------------------------------------------
    // Convenience views
    // -------------------------------------------------------------------------

    /// Ticker, top 10 book levels and recent trades for `pair`, served from
    /// the cache while younger than the cache TTL. Any failing call fails the
    /// whole snapshot and nothing is cached.
    #[instrument(skip(self), name = "kraken::market_snapshot")]
    pub async fn market_snapshot(&self, pair: &str) -> FeedResult<MarketSnapshot> {
        if let Some(hit) = self.cache.get(pair) {
            debug!(pair, "market snapshot served from cache");
            return Ok(hit);
        }

        let ticker = self.ticker(&[pair]).await?;
        let order_book = self.order_book(pair, BookDepth::default()).await?;
        let recent_trades = self.recent_trades(pair, None, None).await?;

        let snapshot = MarketSnapshot {
            pair: pair.to_string(),
            ticker,
            order_book,
            recent_trades,
            fetched_at: Utc::now(),
        };
        self.cache.put(snapshot.clone());
        Ok(snapshot)
    }

    /// Last trade price of `pair`, or `None` if the ticker has no entry for it.
    #[instrument(skip(self), name = "kraken::price")]
    pub async fn price(&self, pair: &str) -> FeedResult<Option<f64>> {
        let result = self.ticker(&[pair]).await?;
        last_trade_price(pair, &result)
    }

    pub fn cache_ttl(&self) -> Duration {
        *self.cache.ttl.read()
    }

    pub fn set_cache_ttl(&self, ttl: Duration) {
        *self.cache.ttl.write() = ttl;
        info!(ttl_secs = ttl.as_secs(), "market snapshot cache TTL updated");
    }

    pub fn clear_cache(&self) {
        let dropped = self.cache.clear();
        info!(dropped, "market snapshot cache cleared");
    }

    // -------------------------------------------------------------------------
    // Private
    // -------------------------------------------------------------------------

    /// POST /0/private/{method} (signed).
    #[instrument(skip(self, params), name = "kraken::private_request")]
    pub async fn private_request(&self, method: &str, params: Params) -> FeedResult<Value> {
        self.request(Endpoint::Private(method.to_string()), params).await
    }

    /// Drop cached snapshots and log the session close. The connection pool is
    /// released when the last clone is dropped.
    pub fn close(&self) {
        self.cache.clear();
        let snap = self.pacer.snapshot();
        info!(
            requests = snap.requests,
            retries = snap.retries,
            failures = snap.failures,
            "Kraken REST client session closed"
        );
    }
}

#[async_trait]
impl MarketDataSource for KrakenRestClient {
    async fn asset_pairs(&self) -> FeedResult<BTreeMap<String, AssetPairInfo>> {
        KrakenRestClient::asset_pairs(self).await
    }

    async fn ohlc(&self, pair: &str, interval: Timeframe, since: Option<i64>) -> FeedResult<OhlcPage> {
        KrakenRestClient::ohlc(self, pair, interval, since).await
    }
}

impl std::fmt::Debug for KrakenRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KrakenRestClient")
            .field("base_url", &self.base_url)
            .field("signer", &self.signer)
            .field("retry", &self.retry)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Response parsing
// -----------------------------------------------------------------------------

/// Unwrap Kraken's `{ "error": [...], "result": ... }` envelope.
pub fn parse_envelope(body: &str) -> FeedResult<Value> {
    let mut root: Value =
        serde_json::from_str(body).map_err(|e| FeedError::MalformedResponse(e.to_string()))?;

    if let Some(errors) = root.get("error").and_then(Value::as_array) {
        if !errors.is_empty() {
            let messages = errors
                .iter()
                .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                .collect();
            return Err(FeedError::Exchange(messages));
        }
    }

    match root.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(FeedError::MissingResultEnvelope),
    }
}

/// Extract candles for `pair` from an OHLC `result` object. Kraken may key the
/// rows under its own pair name (`XXBTZUSD` for `XBTUSD`), so fall back to the
/// first key that is not `last`.
fn parse_ohlc_result(pair: &str, result: &Value) -> FeedResult<OhlcPage> {
    let obj = result
        .as_object()
        .ok_or_else(|| FeedError::MalformedResponse("OHLC result is not an object".into()))?;

    let rows = obj
        .get(pair)
        .or_else(|| obj.iter().find(|(k, _)| k.as_str() != "last").map(|(_, v)| v))
        .and_then(Value::as_array)
        .ok_or_else(|| FeedError::MalformedResponse(format!("OHLC result has no rows for {pair}")))?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let arr = row
            .as_array()
            .ok_or_else(|| FeedError::MalformedResponse("OHLC row is not an array".into()))?;
        if arr.len() < 7 {
            warn!(len = arr.len(), "skipping malformed OHLC row");
            continue;
        }

        let secs = arr[0]
            .as_i64()
            .or_else(|| arr[0].as_f64().map(|f| f as i64))
            .ok_or_else(|| FeedError::MalformedResponse(format!("bad OHLC time: {}", arr[0])))?;
        let timestamp = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| FeedError::MalformedResponse(format!("OHLC time out of range: {secs}")))?;

        candles.push(Candle::new(
            timestamp,
            parse_str_f64(&arr[1])?,
            parse_str_f64(&arr[2])?,
            parse_str_f64(&arr[3])?,
            parse_str_f64(&arr[4])?,
            parse_str_f64(&arr[6])?,
        ));
    }

    Ok(OhlcPage {
        candles,
        last: obj.get("last").and_then(Value::as_i64),
    })
}

/// `c[0]` (last trade price) of the ticker entry for `pair`. Kraken keys the
/// entry under its own pair name, so a single-entry result is used as is.
fn last_trade_price(pair: &str, ticker: &Value) -> FeedResult<Option<f64>> {
    let obj = ticker
        .as_object()
        .ok_or_else(|| FeedError::MalformedResponse("Ticker result is not an object".into()))?;

    let entry = obj
        .get(pair)
        .or_else(|| if obj.len() == 1 { obj.values().next() } else { None });
    match entry.and_then(|e| e.pointer("/c/0")) {
        Some(price) => parse_str_f64(price).map(Some),
        None => Ok(None),
    }
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_str_f64(val: &Value) -> FeedResult<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| FeedError::MalformedResponse(format!("failed to parse '{s}' as f64")))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(FeedError::MalformedResponse(format!(
            "expected string or number, got: {val}"
        )))
    }
}

fn object_len(val: &Value) -> usize {
    val.as_object().map_or(0, |o| o.len())
}
