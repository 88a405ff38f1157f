// =============================================================================
// Kraken Feed — Main Entry Point
// =============================================================================
//
// Backfills the configured symbols, starts live OHLC updates and logs every
// timeline change until Ctrl+C.
// =============================================================================

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kraken_feed::kraken::client::{KrakenRestClient, MarketDataSource};
use kraken_feed::kraken::signer::RequestSigner;
use kraken_feed::kraken::stream::StreamConnection;
use kraken_feed::kraken::symbols::SymbolResolver;
use kraken_feed::market_data::TimelineStore;
use kraken_feed::runtime_config::FeedConfig;

const ENV_CONFIG_PATH: &str = "KRAKEN_FEED_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = FeedConfig::load(&path).unwrap_or_else(|e| {
        warn!(path = %path, error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });
    config.apply_env()?;

    info!(
        symbols = ?config.symbols,
        quote = %config.quote,
        timeframes = ?config.timeline.default_timeframes,
        history = config.timeline.history_count,
        "Kraken feed starting"
    );

    // ── 2. REST client + symbol resolver ─────────────────────────────────
    let signer = match (
        std::env::var("KRAKEN_API_KEY"),
        std::env::var("KRAKEN_API_SECRET"),
    ) {
        (Ok(key), Ok(secret)) if !key.is_empty() && !secret.is_empty() => {
            let signer = RequestSigner::new(key, secret)?;
            info!(api_key = %signer.masked_api_key(), "Private endpoints enabled");
            Some(signer)
        }
        _ => None,
    };

    let rest = Arc::new(KrakenRestClient::new(&config.rest, signer)?);
    let source: Arc<dyn MarketDataSource> = rest.clone();
    let resolver = Arc::new(SymbolResolver::new(Arc::clone(&source)));

    // ── 3. Timeline store ────────────────────────────────────────────────
    let stream = StreamConnection::kraken(config.stream.clone());
    let store = TimelineStore::new(
        source,
        resolver,
        stream,
        config.timeline.clone(),
        config.quote.clone(),
    );

    store.on_data(|symbol, timeframe, candles| {
        if let Some(last) = candles.last() {
            info!(
                symbol,
                timeframe = %timeframe,
                candles = candles.len(),
                time = %last.timestamp,
                close = last.close,
                "timeline updated"
            );
        }
    });
    store.on_error(|symbol, err| {
        error!(symbol = symbol.unwrap_or("-"), error = %err, "feed error");
    });

    // ── 4. Backfill + live ───────────────────────────────────────────────
    let results = store
        .track_many(&config.symbols, &config.timeline.default_timeframes, config.timeline.history_count)
        .await;
    let tracked: Vec<String> = results
        .into_iter()
        .filter_map(|(symbol, ok)| ok.then_some(symbol))
        .collect();

    if tracked.is_empty() {
        warn!("No symbols could be tracked — nothing to stream");
    } else if store.start_live(&tracked).await {
        info!(symbols = ?tracked, "Live updates running. Press Ctrl+C to stop.");
    } else {
        warn!(symbols = ?tracked, "Live updates unavailable, serving backfilled data only");
    }

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    store.close().await;
    rest.close();

    info!("Kraken feed shut down complete.");
    Ok(())
}
