// =============================================================================
// Symbol Resolver — canonical symbols ("BTC") to Kraken pair identifiers
// =============================================================================
//
// Kraken names assets inconsistently: legacy codes carry a class letter
// (XXBT, XETH, ZUSD), Bitcoin is XBT and Dogecoin XDG. The resolver loads the
// AssetPairs catalog once, normalizes every pair to a `BASE/QUOTE` key and
// answers lookups from that table.
//
// The catalog is loaded lazily. Concurrent first callers queue on a load gate
// so exactly one catalog fetch goes out; later callers take the read-locked
// fast path.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{FeedError, FeedResult};
use crate::kraken::client::{AssetPairInfo, MarketDataSource};

/// Quotes tried, in order, when the preferred quote has no pair.
pub const FALLBACK_QUOTES: [&str; 4] = ["USDT", "EUR", "GBP", "USDC"];

// -----------------------------------------------------------------------------
// Data types
// -----------------------------------------------------------------------------

/// Resolution of one canonical `BASE/QUOTE` key to Kraken identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairMapping {
    /// Normalized base asset, e.g. `BTC`.
    pub canonical_symbol: String,
    /// Normalized quote asset, e.g. `USD`.
    pub quote: String,
    /// REST pair id, e.g. `XXBTZUSD`.
    pub exchange_pair_id: String,
    /// Stream pair name, e.g. `BTC/USD`.
    pub stream_channel_name: String,
    pub exchange_base_code: String,
    pub exchange_quote_code: String,
}

impl PairMapping {
    pub fn key(&self) -> String {
        format!("{}/{}", self.canonical_symbol, self.quote)
    }
}

/// Normalized view of the AssetPairs catalog.
#[derive(Debug, Default)]
pub struct PairCatalog {
    mappings: BTreeMap<String, PairMapping>,
    by_stream_name: HashMap<String, String>,
}

impl PairCatalog {
    /// Build from a raw catalog. Pairs are visited in sorted id order and the
    /// first pair that produces a given key wins. Dark-pool pairs are skipped.
    pub fn build(pairs: &BTreeMap<String, AssetPairInfo>) -> Self {
        let mut catalog = Self::default();

        for (pair_id, info) in pairs {
            if pair_id.ends_with(".d") {
                continue;
            }

            let base = normalize_asset(&info.base);
            let quote = normalize_asset(&info.quote);
            if base.is_empty() || quote.is_empty() {
                continue;
            }

            let key = format!("{base}/{quote}");
            if catalog.mappings.contains_key(&key) {
                continue;
            }

            let stream_channel_name = info
                .wsname
                .as_deref()
                .map(normalize_stream_name)
                .unwrap_or_else(|| key.clone());

            catalog
                .by_stream_name
                .entry(stream_channel_name.clone())
                .or_insert_with(|| key.clone());
            catalog.mappings.insert(
                key,
                PairMapping {
                    canonical_symbol: base,
                    quote,
                    exchange_pair_id: pair_id.clone(),
                    stream_channel_name,
                    exchange_base_code: info.base.to_ascii_uppercase(),
                    exchange_quote_code: info.quote.to_ascii_uppercase(),
                },
            );
        }

        catalog
    }

    pub fn get(&self, symbol: &str, quote: &str) -> Option<&PairMapping> {
        self.mappings.get(&format!("{symbol}/{quote}"))
    }

    pub fn by_stream_name(&self, name: &str) -> Option<&PairMapping> {
        self.by_stream_name
            .get(name)
            .and_then(|key| self.mappings.get(key))
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn mappings(&self) -> impl Iterator<Item = &PairMapping> {
        self.mappings.values()
    }
}

/// Map a Kraken asset code to its canonical symbol.
pub fn normalize_asset(code: &str) -> String {
    let code = code.trim().to_ascii_uppercase();
    match code.as_str() {
        "XBT" | "XXBT" => "BTC".to_string(),
        "XDG" | "XXDG" => "DOGE".to_string(),
        c if c.len() == 4 && (c.starts_with('X') || c.starts_with('Z')) => c[1..].to_string(),
        _ => code,
    }
}

/// Rewrite legacy names in a stream pair name (`XBT/USD` → `BTC/USD`).
pub fn normalize_stream_name(wsname: &str) -> String {
    wsname.replace("XBT/", "BTC/").replace("XDG/", "DOGE/")
}

// =============================================================================
// SymbolResolver
// =============================================================================

/// Lazily loaded, memoized symbol resolution over a [`MarketDataSource`].
pub struct SymbolResolver {
    source: Arc<dyn MarketDataSource>,
    catalog: RwLock<Option<Arc<PairCatalog>>>,
    load_gate: Mutex<()>,
}

impl SymbolResolver {
    pub fn new(source: Arc<dyn MarketDataSource>) -> Self {
        Self {
            source,
            catalog: RwLock::new(None),
            load_gate: Mutex::new(()),
        }
    }

    /// The loaded catalog, fetching it on first use.
    pub async fn catalog(&self) -> FeedResult<Arc<PairCatalog>> {
        if let Some(catalog) = self.cached() {
            return Ok(catalog);
        }

        let _gate = self.load_gate.lock().await;
        if let Some(catalog) = self.cached() {
            return Ok(catalog);
        }
        self.load().await
    }

    fn cached(&self) -> Option<Arc<PairCatalog>> {
        self.catalog.read().clone()
    }

    /// Drop the cached catalog and fetch a fresh one.
    pub async fn refresh(&self) -> FeedResult<Arc<PairCatalog>> {
        let _gate = self.load_gate.lock().await;
        self.load().await
    }

    async fn load(&self) -> FeedResult<Arc<PairCatalog>> {
        let pairs = self.source.asset_pairs().await?;
        let catalog = Arc::new(PairCatalog::build(&pairs));
        info!(
            raw_pairs = pairs.len(),
            mapped = catalog.len(),
            "symbol catalog loaded"
        );
        *self.catalog.write() = Some(Arc::clone(&catalog));
        Ok(catalog)
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    /// Resolve `symbol` against `preferred_quote`, falling back through
    /// [`FALLBACK_QUOTES`].
    pub async fn resolve(&self, symbol: &str, preferred_quote: &str) -> FeedResult<PairMapping> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let preferred = preferred_quote.trim().to_ascii_uppercase();
        let catalog = self.catalog().await?;

        let candidates = std::iter::once(preferred.as_str())
            .chain(FALLBACK_QUOTES.iter().copied().filter(|q| *q != preferred));

        for quote in candidates {
            if let Some(mapping) = catalog.get(&symbol, quote) {
                if quote != preferred {
                    debug!(symbol = %symbol, preferred = %preferred, quote, "using fallback quote");
                }
                return Ok(mapping.clone());
            }
        }

        Err(FeedError::SymbolNotFound(format!("{symbol}/{preferred}")))
    }

    /// Whether `symbol` resolves against `quote` or any fallback quote.
    pub async fn validate_symbol(&self, symbol: &str, quote: &str) -> FeedResult<bool> {
        match self.resolve(symbol, quote).await {
            Ok(_) => Ok(true),
            Err(FeedError::SymbolNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Every quote `symbol` trades against, sorted.
    pub async fn quotes_for_symbol(&self, symbol: &str) -> FeedResult<Vec<String>> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let catalog = self.catalog().await?;
        let mut quotes: Vec<String> = catalog
            .mappings()
            .filter(|m| m.canonical_symbol == symbol)
            .map(|m| m.quote.clone())
            .collect();
        quotes.sort();
        Ok(quotes)
    }

    /// Reverse lookup from a stream pair name (`BTC/USD`).
    pub async fn lookup_stream_name(&self, stream_name: &str) -> FeedResult<Option<PairMapping>> {
        let catalog = self.catalog().await?;
        Ok(catalog.by_stream_name(stream_name).cloned())
    }

    /// Sorted, de-duplicated canonical base symbols.
    pub async fn list_available_symbols(&self) -> FeedResult<Vec<String>> {
        let catalog = self.catalog().await?;
        let symbols: BTreeSet<String> = catalog
            .mappings()
            .map(|m| m.canonical_symbol.clone())
            .collect();
        Ok(symbols.into_iter().collect())
    }

    /// Every `BASE/QUOTE` key in the catalog, sorted.
    pub async fn list_all_pairs(&self) -> FeedResult<Vec<String>> {
        let catalog = self.catalog().await?;
        Ok(catalog.mappings().map(PairMapping::key).collect())
    }

    pub fn is_loaded(&self) -> bool {
        self.catalog.read().is_some()
    }
}

impl std::fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::kraken::client::OhlcPage;
    use crate::types::Timeframe;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeCatalog {
        pairs: BTreeMap<String, AssetPairInfo>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MarketDataSource for FakeCatalog {
        async fn asset_pairs(&self) -> FeedResult<BTreeMap<String, AssetPairInfo>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.pairs.clone())
        }

        async fn ohlc(&self, _: &str, _: Timeframe, _: Option<i64>) -> FeedResult<OhlcPage> {
            Err(FeedError::Transport("not used".into()))
        }
    }

    fn pair(base: &str, quote: &str, wsname: Option<&str>) -> AssetPairInfo {
        AssetPairInfo {
            base: base.into(),
            quote: quote.into(),
            wsname: wsname.map(str::to_string),
            ..Default::default()
        }
    }

    fn kraken_like() -> Arc<FakeCatalog> {
        let mut pairs = BTreeMap::new();
        pairs.insert("XXBTZUSD".into(), pair("XXBT", "ZUSD", Some("XBT/USD")));
        pairs.insert("XXBTZUSD.d".into(), pair("XXBT", "ZUSD", Some("XBT/USD")));
        pairs.insert("XBTUSDT".into(), pair("XXBT", "USDT", Some("XBT/USDT")));
        pairs.insert("XETHZEUR".into(), pair("XETH", "ZEUR", Some("ETH/EUR")));
        pairs.insert("XDGUSD".into(), pair("XXDG", "ZUSD", Some("XDG/USD")));
        pairs.insert("SOLUSDC".into(), pair("SOL", "USDC", None));
        pairs.insert("ADAGBP".into(), pair("ADA", "ZGBP", Some("ADA/GBP")));
        Arc::new(FakeCatalog {
            pairs,
            fetches: AtomicUsize::new(0),
        })
    }

    #[test]
    fn normalizes_legacy_asset_codes() {
        assert_eq!(normalize_asset("XXBT"), "BTC");
        assert_eq!(normalize_asset("XBT"), "BTC");
        assert_eq!(normalize_asset("XXDG"), "DOGE");
        assert_eq!(normalize_asset("XETH"), "ETH");
        assert_eq!(normalize_asset("ZUSD"), "USD");
        assert_eq!(normalize_asset("USDT"), "USDT");
        assert_eq!(normalize_asset("XTZ"), "XTZ");
        assert_eq!(normalize_asset("sol"), "SOL");
        assert_eq!(normalize_stream_name("XBT/USD"), "BTC/USD");
    }

    #[tokio::test]
    async fn resolves_legacy_bitcoin_to_btc() {
        let resolver = SymbolResolver::new(kraken_like());
        let m = resolver.resolve("btc", "usd").await.unwrap();
        assert_eq!(m.canonical_symbol, "BTC");
        assert_eq!(m.quote, "USD");
        assert_eq!(m.exchange_pair_id, "XXBTZUSD");
        assert_eq!(m.stream_channel_name, "BTC/USD");
        assert_eq!(m.exchange_base_code, "XXBT");
    }

    #[tokio::test]
    async fn falls_back_through_quote_order() {
        let resolver = SymbolResolver::new(kraken_like());

        let eth = resolver.resolve("ETH", "USD").await.unwrap();
        assert_eq!(eth.quote, "EUR");

        let ada = resolver.resolve("ADA", "USD").await.unwrap();
        assert_eq!(ada.quote, "GBP");

        let sol = resolver.resolve("SOL", "USD").await.unwrap();
        assert_eq!(sol.quote, "USDC");
        assert_eq!(sol.stream_channel_name, "SOL/USDC");

        assert!(matches!(
            resolver.resolve("NOPE", "USD").await,
            Err(FeedError::SymbolNotFound(_))
        ));
        assert!(!resolver.validate_symbol("NOPE", "USD").await.unwrap());
        assert!(resolver.validate_symbol("DOGE", "USD").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_first_calls_fetch_catalog_once() {
        let source = kraken_like();
        let resolver = Arc::new(SymbolResolver::new(source.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&resolver);
                tokio::spawn(async move { r.resolve("BTC", "USD").await })
            })
            .collect();
        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        resolver.refresh().await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn listings_and_reverse_lookup() {
        let resolver = SymbolResolver::new(kraken_like());
        assert!(!resolver.is_loaded());

        let symbols = resolver.list_available_symbols().await.unwrap();
        assert_eq!(symbols, vec!["ADA", "BTC", "DOGE", "ETH", "SOL"]);

        let pairs = resolver.list_all_pairs().await.unwrap();
        assert!(pairs.contains(&"BTC/USDT".to_string()));
        assert_eq!(pairs.len(), 6);

        assert_eq!(resolver.quotes_for_symbol("btc").await.unwrap(), vec!["USD", "USDT"]);

        let m = resolver.lookup_stream_name("DOGE/USD").await.unwrap().unwrap();
        assert_eq!(m.canonical_symbol, "DOGE");
        assert!(resolver.lookup_stream_name("XYZ/USD").await.unwrap().is_none());
    }
}
