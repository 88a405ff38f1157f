// =============================================================================
// Timeline Store — REST backfill + live OHLC ticks per (symbol, timeframe)
// =============================================================================
//
// `track` resolves a symbol, backfills each requested timeframe over REST and
// registers the symbol for live updates on its finest loaded timeframe. Live
// ticks arrive from the stream actor's `ohlc` channel handler and are appended
// to that timeline. Readers always get owned snapshots; callbacks run after
// the write lock has been released.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::error::{FeedError, FeedResult};
use crate::kraken::client::MarketDataSource;
use crate::kraken::messages::{ohlc_ticks, OhlcTick, SubscriptionRequest};
use crate::kraken::stream::StreamConnection;
use crate::kraken::symbols::{PairMapping, SymbolResolver};
use crate::market_data::timeline::{Candle, Timeline};
use crate::runtime_config::TimelineConfig;
use crate::types::{Channel, Timeframe};

/// Receives `(symbol, timeframe, full timeline snapshot)` after every change.
pub type CandleCallback = Arc<dyn Fn(&str, Timeframe, &[Candle]) + Send + Sync>;
/// Receives failures; the symbol is `None` for stream-level errors.
pub type StoreErrorCallback = Arc<dyn Fn(Option<&str>, &FeedError) + Send + Sync>;

type TimelineKey = (String, Timeframe);

/// Live-tracking entry for one canonical symbol.
#[derive(Debug, Clone)]
struct TrackedSymbol {
    mapping: PairMapping,
    live_timeframe: Timeframe,
    timeframes: Vec<Timeframe>,
}

// ---------------------------------------------------------------------------
// TimelineStore
// ---------------------------------------------------------------------------

pub struct TimelineStore {
    source: Arc<dyn MarketDataSource>,
    resolver: Arc<SymbolResolver>,
    stream: StreamConnection,
    config: TimelineConfig,
    quote: String,
    timelines: RwLock<HashMap<TimelineKey, Timeline>>,
    tracked: RwLock<HashMap<String, TrackedSymbol>>,
    data_callbacks: RwLock<Vec<CandleCallback>>,
    error_callbacks: RwLock<Vec<StoreErrorCallback>>,
}

impl TimelineStore {
    /// Build the store and wire it to the stream's `ohlc` channel and error
    /// reports. The stream holds only a weak reference back to the store.
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        resolver: Arc<SymbolResolver>,
        stream: StreamConnection,
        config: TimelineConfig,
        quote: impl Into<String>,
    ) -> Arc<Self> {
        let store = Arc::new(Self {
            source,
            resolver,
            stream,
            config,
            quote: quote.into().to_ascii_uppercase(),
            timelines: RwLock::new(HashMap::new()),
            tracked: RwLock::new(HashMap::new()),
            data_callbacks: RwLock::new(Vec::new()),
            error_callbacks: RwLock::new(Vec::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&store);
        store.stream.on_channel("ohlc", move |_, message| {
            if let Some(store) = weak.upgrade() {
                store.handle_ohlc_message(message);
            }
        });

        let weak: Weak<Self> = Arc::downgrade(&store);
        store.stream.on_error(move |err| {
            if let Some(store) = weak.upgrade() {
                store.report(None, err);
            }
        });

        store
    }

    // -------------------------------------------------------------------------
    // Subscribers
    // -------------------------------------------------------------------------

    pub fn on_data(&self, callback: impl Fn(&str, Timeframe, &[Candle]) + Send + Sync + 'static) {
        self.data_callbacks.write().push(Arc::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(Option<&str>, &FeedError) + Send + Sync + 'static) {
        self.error_callbacks.write().push(Arc::new(callback));
    }

    // -------------------------------------------------------------------------
    // Backfill
    // -------------------------------------------------------------------------

    /// Resolve `symbol`, backfill each timeframe and register it for live
    /// updates.
    ///
    /// An empty `timeframes` slice means the configured defaults; a zero
    /// `history_count` means the configured history. Returns `true` if at
    /// least one timeframe was loaded. Per-timeframe failures go to the error
    /// callbacks and do not abort the others.
    #[instrument(skip(self), name = "timeline::track")]
    pub async fn track(&self, symbol: &str, timeframes: &[Timeframe], history_count: usize) -> bool {
        let symbol = symbol.trim().to_ascii_uppercase();

        let mut wanted: Vec<Timeframe> = if timeframes.is_empty() {
            self.config.default_timeframes.clone()
        } else {
            timeframes.to_vec()
        };
        wanted.sort();
        wanted.dedup();
        if wanted.is_empty() {
            warn!(symbol = %symbol, "no timeframes to load");
            return false;
        }

        let mapping = match self.resolver.resolve(&symbol, &self.quote).await {
            Ok(mapping) => mapping,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "cannot track symbol");
                self.report(Some(&symbol), &e);
                return false;
            }
        };

        let cap = self.config.max_candles.max(1);
        let requested = if history_count == 0 {
            self.config.history_count
        } else {
            history_count
        };
        let keep = requested.min(cap);

        let mut loaded = Vec::with_capacity(wanted.len());
        for tf in wanted {
            match self.source.ohlc(&mapping.exchange_pair_id, tf, None).await {
                Ok(page) if page.candles.is_empty() => {
                    warn!(symbol = %symbol, timeframe = %tf, "backfill returned no candles");
                }
                Ok(page) => {
                    let timeline = Timeline::from_history(page.candles, keep, cap);
                    let snapshot = timeline.to_vec();
                    self.timelines.write().insert((symbol.clone(), tf), timeline);
                    debug!(symbol = %symbol, timeframe = %tf, candles = snapshot.len(), "backfilled");
                    self.emit(&symbol, tf, &snapshot);
                    loaded.push(tf);
                }
                Err(e) => {
                    warn!(symbol = %symbol, timeframe = %tf, error = %e, "backfill failed");
                    self.report(Some(&symbol), &e);
                }
            }
        }

        let Some(&live_timeframe) = loaded.iter().min() else {
            return false;
        };

        info!(
            symbol = %symbol,
            pair = %mapping.exchange_pair_id,
            stream = %mapping.stream_channel_name,
            live = %live_timeframe,
            timeframes = ?loaded,
            "symbol tracked"
        );
        self.tracked.write().insert(
            symbol,
            TrackedSymbol {
                mapping,
                live_timeframe,
                timeframes: loaded,
            },
        );
        true
    }

    /// `track` several symbols concurrently.
    pub async fn track_many(
        &self,
        symbols: &[String],
        timeframes: &[Timeframe],
        history_count: usize,
    ) -> Vec<(String, bool)> {
        let results = join_all(
            symbols
                .iter()
                .map(|s| self.track(s, timeframes, history_count)),
        )
        .await;
        symbols.iter().cloned().zip(results).collect()
    }

    // -------------------------------------------------------------------------
    // Live
    // -------------------------------------------------------------------------

    /// Start the stream and subscribe the live timeframe of each tracked
    /// symbol in `symbols` (every tracked symbol when empty).
    ///
    /// Returns `false` if nothing could be subscribed, the stream did not
    /// connect in time, or any subscribe request failed.
    pub async fn start_live(&self, symbols: &[String]) -> bool {
        let mut groups: BTreeMap<Timeframe, Vec<String>> = BTreeMap::new();
        {
            let tracked = self.tracked.read();
            let wanted: Vec<String> = if symbols.is_empty() {
                tracked.keys().cloned().collect()
            } else {
                symbols.iter().map(|s| s.trim().to_ascii_uppercase()).collect()
            };
            for symbol in wanted {
                match tracked.get(&symbol) {
                    Some(t) => groups
                        .entry(t.live_timeframe)
                        .or_default()
                        .push(t.mapping.stream_channel_name.clone()),
                    None => warn!(symbol = %symbol, "not tracked — call track() first"),
                }
            }
        }
        if groups.is_empty() {
            return false;
        }

        if let Err(e) = self.stream.start().await {
            self.report(None, &e);
            return false;
        }
        if !self.stream.wait_connected(self.config.live_connect_wait()).await {
            warn!("stream did not connect in time");
            self.report(None, &FeedError::NotConnected);
            return false;
        }

        let mut all_ok = true;
        for (interval, mut pairs) in groups {
            pairs.sort();
            pairs.dedup();
            let request = SubscriptionRequest::new(Channel::Ohlc { interval }, pairs);
            if let Err(e) = self.stream.subscribe(request).await {
                self.report(None, &e);
                all_ok = false;
            }
        }
        all_ok
    }

    /// Apply every tick of an `ohlc` channel message.
    pub(crate) fn handle_ohlc_message(&self, message: &Value) {
        for tick in ohlc_ticks(message) {
            self.on_live_tick(&tick.symbol, &tick);
        }
    }

    /// Append one live tick to the live timeline of whichever tracked symbol
    /// streams as `stream_pair`. Unknown pairs are dropped silently.
    pub fn on_live_tick(&self, stream_pair: &str, tick: &OhlcTick) {
        let target = {
            let tracked = self.tracked.read();
            tracked
                .iter()
                .find(|(_, t)| t.mapping.stream_channel_name == stream_pair)
                .map(|(symbol, t)| (symbol.clone(), t.live_timeframe))
        };
        let Some((symbol, timeframe)) = target else {
            return;
        };

        if let Some(minutes) = tick.interval {
            if minutes != timeframe.minutes() {
                debug!(symbol = %symbol, minutes, "ignoring tick for another interval");
                return;
            }
        }

        let candle = tick.to_candle(Utc::now());
        let snapshot = {
            let mut timelines = self.timelines.write();
            let Some(timeline) = timelines.get_mut(&(symbol.clone(), timeframe)) else {
                return;
            };
            if !timeline.push(candle) {
                debug!(symbol = %symbol, timeframe = %timeframe, "ignoring stale tick");
                return;
            }
            timeline.to_vec()
        };

        self.emit(&symbol, timeframe, &snapshot);
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub fn get_timeline(&self, symbol: &str, timeframe: Timeframe) -> Option<Vec<Candle>> {
        let key = (symbol.to_ascii_uppercase(), timeframe);
        self.timelines.read().get(&key).map(Timeline::to_vec)
    }

    pub fn get_latest_candle(&self, symbol: &str, timeframe: Timeframe) -> Option<Candle> {
        let key = (symbol.to_ascii_uppercase(), timeframe);
        self.timelines
            .read()
            .get(&key)
            .and_then(|t| t.latest().cloned())
    }

    /// Every loaded timeline for `symbol`, finest first.
    pub fn get_all_timeframes(&self, symbol: &str) -> BTreeMap<Timeframe, Vec<Candle>> {
        let symbol = symbol.to_ascii_uppercase();
        self.timelines
            .read()
            .iter()
            .filter(|((s, _), _)| *s == symbol)
            .map(|((_, tf), t)| (*tf, t.to_vec()))
            .collect()
    }

    pub fn loaded_timeframes(&self, symbol: &str) -> Vec<Timeframe> {
        self.tracked
            .read()
            .get(&symbol.to_ascii_uppercase())
            .map(|t| t.timeframes.clone())
            .unwrap_or_default()
    }

    pub fn live_timeframe(&self, symbol: &str) -> Option<Timeframe> {
        self.tracked
            .read()
            .get(&symbol.to_ascii_uppercase())
            .map(|t| t.live_timeframe)
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.tracked.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// First `limit` tradeable canonical symbols, alphabetically.
    pub async fn available_symbols(&self, limit: usize) -> FeedResult<Vec<String>> {
        let mut symbols = self.resolver.list_available_symbols().await?;
        symbols.truncate(limit);
        Ok(symbols)
    }

    pub fn stream(&self) -> &StreamConnection {
        &self.stream
    }

    /// Stop the stream and drop all timelines and tracking state.
    pub async fn close(&self) {
        self.stream.stop().await;
        self.timelines.write().clear();
        self.tracked.write().clear();
        info!("timeline store closed");
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    fn emit(&self, symbol: &str, timeframe: Timeframe, candles: &[Candle]) {
        let callbacks = self.data_callbacks.read().clone();
        for cb in callbacks {
            if catch_unwind(AssertUnwindSafe(|| cb(symbol, timeframe, candles))).is_err() {
                warn!(symbol, timeframe = %timeframe, "data callback panicked");
            }
        }
    }

    fn report(&self, symbol: Option<&str>, err: &FeedError) {
        let callbacks = self.error_callbacks.read().clone();
        for cb in callbacks {
            if catch_unwind(AssertUnwindSafe(|| cb(symbol, err))).is_err() {
                warn!("error callback panicked");
            }
        }
    }
}

impl std::fmt::Debug for TimelineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineStore")
            .field("quote", &self.quote)
            .field("tracked", &self.tracked_symbols())
            .field("timelines", &self.timelines.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kraken::client::{AssetPairInfo, OhlcPage};
    use crate::kraken::stream::{StreamConnector, StreamTransport};
    use crate::runtime_config::StreamConfig;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use parking_lot::Mutex;

    const BASE_SECS: i64 = 1_700_000_000;

    /// Catalog with BTC (legacy codes) and ETH; OHLC returns `rows` candles
    /// per call, except for timeframes listed in `failing`.
    struct FakeHistory {
        rows: usize,
        failing: Vec<Timeframe>,
        calls: Mutex<Vec<(String, Timeframe)>>,
    }

    impl FakeHistory {
        fn new(rows: usize) -> Self {
            Self {
                rows,
                failing: Vec::new(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MarketDataSource for FakeHistory {
        async fn asset_pairs(&self) -> FeedResult<BTreeMap<String, AssetPairInfo>> {
            let mut pairs = BTreeMap::new();
            pairs.insert(
                "XXBTZUSD".to_string(),
                AssetPairInfo {
                    altname: "XBTUSD".into(),
                    wsname: Some("XBT/USD".into()),
                    base: "XXBT".into(),
                    quote: "ZUSD".into(),
                    ..Default::default()
                },
            );
            pairs.insert(
                "XETHZUSD".to_string(),
                AssetPairInfo {
                    altname: "ETHUSD".into(),
                    wsname: Some("ETH/USD".into()),
                    base: "XETH".into(),
                    quote: "ZUSD".into(),
                    ..Default::default()
                },
            );
            Ok(pairs)
        }

        async fn ohlc(&self, pair: &str, interval: Timeframe, _since: Option<i64>) -> FeedResult<OhlcPage> {
            self.calls.lock().push((pair.to_string(), interval));
            if self.failing.contains(&interval) {
                return Err(FeedError::Transport("timeout".into()));
            }
            let step = i64::from(interval.minutes()) * 60;
            let candles = (0..self.rows as i64)
                .map(|i| {
                    let ts = Utc.timestamp_opt(BASE_SECS + i * step, 0).unwrap();
                    Candle::new(ts, 100.0, 101.0, 99.0, 100.5, 1.0)
                })
                .collect();
            Ok(OhlcPage { candles, last: None })
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl StreamConnector for RefusingConnector {
        async fn connect(&self, _url: &str) -> FeedResult<Box<dyn StreamTransport>> {
            Err(FeedError::Transport("refused".into()))
        }
    }

    fn store_with(history: FakeHistory, config: TimelineConfig) -> (Arc<TimelineStore>, Arc<FakeHistory>) {
        let history = Arc::new(history);
        let source: Arc<dyn MarketDataSource> = history.clone();
        let resolver = Arc::new(SymbolResolver::new(Arc::clone(&source)));
        let stream = StreamConnection::new(StreamConfig::default(), Arc::new(RefusingConnector));
        let store = TimelineStore::new(source, resolver, stream, config, "USD");
        (store, history)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn tick(symbol: &str, ts: DateTime<Utc>, close: f64) -> OhlcTick {
        OhlcTick {
            symbol: symbol.to_string(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            vwap: None,
            trades: None,
            interval_begin: None,
            interval: Some(1),
            timestamp: Some(ts),
        }
    }

    fn is_strictly_ascending(candles: &[Candle]) -> bool {
        candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp)
    }

    #[tokio::test]
    async fn track_backfills_each_timeframe_within_history_count() {
        let (store, history) = store_with(FakeHistory::new(720), TimelineConfig::default());
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        store.on_data(move |s, tf, candles| sink.lock().push((s.to_string(), tf, candles.len())));

        assert!(store.track("btc", &[Timeframe::M1, Timeframe::M5], 500).await);

        for tf in [Timeframe::M1, Timeframe::M5] {
            let timeline = store.get_timeline("BTC", tf).unwrap();
            assert_eq!(timeline.len(), 500);
            assert!(is_strictly_ascending(&timeline));
        }
        assert_eq!(
            emitted.lock().as_slice(),
            &[
                ("BTC".to_string(), Timeframe::M1, 500),
                ("BTC".to_string(), Timeframe::M5, 500)
            ]
        );
        assert!(history.calls.lock().iter().all(|(pair, _)| pair == "XXBTZUSD"));
        assert_eq!(store.live_timeframe("BTC"), Some(Timeframe::M1));
        assert_eq!(store.tracked_symbols(), vec!["BTC"]);
        assert_eq!(store.loaded_timeframes("BTC"), vec![Timeframe::M1, Timeframe::M5]);
        assert_eq!(store.get_all_timeframes("BTC").len(), 2);
    }

    #[tokio::test]
    async fn live_ticks_append_and_respect_rolling_cap() {
        let config = TimelineConfig {
            max_candles: 1000,
            ..TimelineConfig::default()
        };
        let (store, _) = store_with(FakeHistory::new(500), config);
        assert!(store.track("BTC", &[Timeframe::M1], 500).await);

        let last_backfill = store.get_latest_candle("BTC", Timeframe::M1).unwrap().timestamp;
        let first_tick = last_backfill.timestamp() + 60;

        store.on_live_tick("BTC/USD", &tick("BTC/USD", at(first_tick), 1.0));
        assert_eq!(store.get_timeline("BTC", Timeframe::M1).unwrap().len(), 501);

        for i in 1..1001 {
            store.on_live_tick("BTC/USD", &tick("BTC/USD", at(first_tick + i * 60), 1.0));
        }

        let timeline = store.get_timeline("BTC", Timeframe::M1).unwrap();
        assert_eq!(timeline.len(), 1000);
        assert!(is_strictly_ascending(&timeline));
        // 500 backfilled + 1001 ticks, capped at 1000: the backfill and the
        // first tick have been evicted.
        assert_eq!(timeline[0].timestamp, at(first_tick + 60));
        assert_eq!(timeline[999].timestamp, at(first_tick + 1000 * 60));
    }

    #[tokio::test]
    async fn unknown_stream_pair_is_ignored_silently() {
        let (store, _) = store_with(FakeHistory::new(10), TimelineConfig::default());
        assert!(store.track("BTC", &[Timeframe::M1], 10).await);

        let data_calls = Arc::new(Mutex::new(0usize));
        let errors = Arc::new(Mutex::new(0usize));
        let d = Arc::clone(&data_calls);
        let e = Arc::clone(&errors);
        store.on_data(move |_, _, _| *d.lock() += 1);
        store.on_error(move |_, _| *e.lock() += 1);

        store.on_live_tick("DOGE/USD", &tick("DOGE/USD", at(BASE_SECS * 2), 1.0));

        assert_eq!(*data_calls.lock(), 0);
        assert_eq!(*errors.lock(), 0);
        assert_eq!(store.get_timeline("BTC", Timeframe::M1).unwrap().len(), 10);
    }

    #[tokio::test]
    async fn stale_and_foreign_interval_ticks_are_dropped() {
        let (store, _) = store_with(FakeHistory::new(10), TimelineConfig::default());
        assert!(store.track("BTC", &[Timeframe::M1], 10).await);
        let last = store.get_latest_candle("BTC", Timeframe::M1).unwrap().timestamp;

        store.on_live_tick("BTC/USD", &tick("BTC/USD", last, 1.0));
        let mut five_minute = tick("BTC/USD", at(last.timestamp() + 60), 1.0);
        five_minute.interval = Some(5);
        store.on_live_tick("BTC/USD", &five_minute);

        assert_eq!(store.get_timeline("BTC", Timeframe::M1).unwrap().len(), 10);
    }

    #[tokio::test]
    async fn ohlc_channel_message_feeds_every_entry() {
        let (store, _) = store_with(FakeHistory::new(3), TimelineConfig::default());
        assert!(store.track("BTC", &[Timeframe::M1], 3).await);
        assert!(store.track("ETH", &[Timeframe::M1], 3).await);

        let message = serde_json::json!({
            "channel": "ohlc",
            "type": "update",
            "data": [
                {"symbol":"BTC/USD","open":1.0,"high":1.0,"low":1.0,"close":2.0,"volume":1.0,
                 "interval":1,"timestamp":"2030-01-01T00:00:00Z"},
                {"symbol":"ETH/USD","open":1.0,"high":1.0,"low":1.0,"close":3.0,"volume":1.0,
                 "interval":1,"timestamp":"2030-01-01T00:00:00Z"}
            ]
        });
        store.handle_ohlc_message(&message);

        assert_eq!(store.get_latest_candle("BTC", Timeframe::M1).unwrap().close, 2.0);
        assert_eq!(store.get_latest_candle("ETH", Timeframe::M1).unwrap().close, 3.0);
    }

    #[tokio::test]
    async fn partial_backfill_failure_still_tracks() {
        let mut history = FakeHistory::new(50);
        history.failing = vec![Timeframe::M1];
        let (store, _) = store_with(history, TimelineConfig::default());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        store.on_error(move |s, e| sink.lock().push((s.map(str::to_string), e.clone())));

        assert!(store.track("BTC", &[Timeframe::M1, Timeframe::H1], 20).await);
        assert_eq!(store.loaded_timeframes("BTC"), vec![Timeframe::H1]);
        assert_eq!(store.live_timeframe("BTC"), Some(Timeframe::H1));
        assert!(store.get_timeline("BTC", Timeframe::M1).is_none());
        assert_eq!(errors.lock().len(), 1);
        assert_eq!(errors.lock()[0].0.as_deref(), Some("BTC"));
    }

    #[tokio::test]
    async fn unresolvable_symbol_is_reported_and_not_tracked() {
        let (store, history) = store_with(FakeHistory::new(10), TimelineConfig::default());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        store.on_error(move |_, e| sink.lock().push(e.clone()));

        assert!(!store.track("NOPE", &[Timeframe::M1], 10).await);
        assert!(matches!(errors.lock()[0], FeedError::SymbolNotFound(_)));
        assert!(history.calls.lock().is_empty());
        assert!(store.tracked_symbols().is_empty());
    }

    #[tokio::test]
    async fn empty_timeframes_use_configured_defaults() {
        let config = TimelineConfig {
            default_timeframes: vec![Timeframe::H1, Timeframe::M15],
            ..TimelineConfig::default()
        };
        let (store, history) = store_with(FakeHistory::new(5), config);
        assert!(store.track("ETH", &[], 0).await);
        let requested: Vec<Timeframe> = history.calls.lock().iter().map(|(_, tf)| *tf).collect();
        assert_eq!(requested, vec![Timeframe::M15, Timeframe::H1]);
        assert_eq!(store.live_timeframe("ETH"), Some(Timeframe::M15));
    }

    #[tokio::test]
    async fn track_many_and_close() {
        let (store, _) = store_with(FakeHistory::new(5), TimelineConfig::default());
        let results = store
            .track_many(
                &["BTC".to_string(), "ETH".to_string(), "NOPE".to_string()],
                &[Timeframe::M1],
                5,
            )
            .await;
        assert_eq!(
            results,
            vec![
                ("BTC".to_string(), true),
                ("ETH".to_string(), true),
                ("NOPE".to_string(), false)
            ]
        );
        assert_eq!(store.available_symbols(1).await.unwrap(), vec!["BTC"]);

        store.close().await;
        assert!(store.tracked_symbols().is_empty());
        assert!(store.get_timeline("BTC", Timeframe::M1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_live_fails_when_stream_cannot_connect() {
        let (store, _) = store_with(FakeHistory::new(5), TimelineConfig::default());
        assert!(!store.start_live(&["BTC".to_string()]).await);

        assert!(store.track("BTC", &[Timeframe::M1], 5).await);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        store.on_error(move |_, e| sink.lock().push(e.clone()));

        assert!(!store.start_live(&[]).await);
        assert!(errors
            .lock()
            .iter()
            .any(|e| matches!(e, FeedError::NotConnected)));
    }
}
