// =============================================================================
// Runtime Configuration — feed settings loaded from JSON + environment
// =============================================================================
//
// Every field carries a serde default so a partial (or empty) JSON file is
// valid. Environment variables override the file for the handful of settings
// an operator changes most often. Credentials are never read from the file:
// they come from KRAKEN_API_KEY / KRAKEN_API_SECRET only.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Timeframe;

pub const ENV_SYMBOLS: &str = "KRAKEN_FEED_SYMBOLS";
pub const ENV_TIMEFRAMES: &str = "KRAKEN_FEED_TIMEFRAMES";
pub const ENV_HISTORY: &str = "KRAKEN_FEED_HISTORY";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}

fn default_quote() -> String {
    "USD".to_string()
}

fn default_timeframes() -> Vec<Timeframe> {
    Timeframe::ALL.to_vec()
}

fn default_history_count() -> usize {
    200
}

fn default_max_candles() -> usize {
    1000
}

fn default_rest_base_url() -> String {
    "https://api.kraken.com".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_min_request_interval_ms() -> u64 {
    1000
}

fn default_snapshot_cache_ttl_secs() -> u64 {
    60
}

fn default_stream_url() -> String {
    "wss://ws.kraken.com/v2".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_reconnect_pause_ms() -> u64 {
    1000
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_ping_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_live_connect_wait_secs() -> u64 {
    10
}

// =============================================================================
// RestConfig
// =============================================================================

/// REST client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_rest_base_url")]
    pub base_url: String,

    /// Per-request timeout, seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Extra attempts after the first for transport failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before retry n is `2^n × backoff_unit_ms`.
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,

    /// Minimum gap between request starts; 0 disables pacing.
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    /// How long a market snapshot is served from cache.
    #[serde(default = "default_snapshot_cache_ttl_secs")]
    pub snapshot_cache_ttl_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_rest_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_unit_ms: default_backoff_unit_ms(),
            min_request_interval_ms: default_min_request_interval_ms(),
            snapshot_cache_ttl_secs: default_snapshot_cache_ttl_secs(),
        }
    }
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn snapshot_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_cache_ttl_secs)
    }
}

// =============================================================================
// StreamConfig
// =============================================================================

/// WebSocket connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_url")]
    pub url: String,

    /// Consecutive failed connects before the stream gives up for good.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Ceiling for the exponential reconnect delay.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Pause before reconnecting after an established session drops.
    #[serde(default = "default_reconnect_pause_ms")]
    pub reconnect_pause_ms: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Extra silence tolerated after a ping before the session is dead.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_backoff_secs: default_max_backoff_secs(),
            reconnect_pause_ms: default_reconnect_pause_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl StreamConfig {
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn reconnect_pause(&self) -> Duration {
        Duration::from_millis(self.reconnect_pause_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Silence after which the session is considered dead.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs + self.ping_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Delay after consecutive connect failure number `failures`:
    /// `min(2^failures, max_backoff)` seconds.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let secs = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
        Duration::from_secs(secs.min(self.max_backoff_secs))
    }
}

// =============================================================================
// TimelineConfig
// =============================================================================

/// Candle history settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineConfig {
    /// Timeframes backfilled when `track` is given none.
    #[serde(default = "default_timeframes")]
    pub default_timeframes: Vec<Timeframe>,

    /// Candles requested per timeframe at backfill.
    #[serde(default = "default_history_count")]
    pub history_count: usize,

    /// Rolling cap per timeline.
    #[serde(default = "default_max_candles")]
    pub max_candles: usize,

    /// How long `start_live` waits for the stream to connect.
    #[serde(default = "default_live_connect_wait_secs")]
    pub live_connect_wait_secs: u64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            default_timeframes: default_timeframes(),
            history_count: default_history_count(),
            max_candles: default_max_candles(),
            live_connect_wait_secs: default_live_connect_wait_secs(),
        }
    }
}

impl TimelineConfig {
    pub fn live_connect_wait(&self) -> Duration {
        Duration::from_secs(self.live_connect_wait_secs)
    }
}

// =============================================================================
// FeedConfig
// =============================================================================

/// Top-level configuration for the feed binary and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Canonical symbols tracked at start-up (e.g. "BTC").
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Preferred quote currency for symbol resolution.
    #[serde(default = "default_quote")]
    pub quote: String,

    #[serde(default)]
    pub rest: RestConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub timeline: TimelineConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            quote: default_quote(),
            rest: RestConfig::default(),
            stream: StreamConfig::default(),
            timeline: TimelineConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            quote = %config.quote,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the process environment in
    /// production, a map in tests).
    ///
    /// Lists are comma-separated; blank entries are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_SYMBOLS) {
            let symbols: Vec<String> = split_list(&raw).map(|s| s.to_ascii_uppercase()).collect();
            if symbols.is_empty() {
                warn!(var = ENV_SYMBOLS, "override is empty — keeping configured symbols");
            } else {
                self.symbols = symbols;
            }
        }

        if let Some(raw) = lookup(ENV_TIMEFRAMES) {
            let timeframes = split_list(&raw)
                .map(|s| s.parse::<Timeframe>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("invalid {ENV_TIMEFRAMES} value '{raw}'"))?;
            if !timeframes.is_empty() {
                self.timeline.default_timeframes = timeframes;
            }
        }

        if let Some(raw) = lookup(ENV_HISTORY) {
            self.timeline.history_count = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {ENV_HISTORY} value '{raw}'"))?;
        }

        Ok(())
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = FeedConfig::default();
        assert_eq!(cfg.symbols, vec!["BTC", "ETH"]);
        assert_eq!(cfg.quote, "USD");
        assert_eq!(cfg.rest.base_url, "https://api.kraken.com");
        assert_eq!(cfg.rest.max_retries, 3);
        assert_eq!(cfg.rest.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.stream.url, "wss://ws.kraken.com/v2");
        assert_eq!(cfg.stream.max_reconnect_attempts, 5);
        assert_eq!(cfg.stream.idle_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.timeline.max_candles, 1000);
        assert_eq!(cfg.timeline.history_count, 200);
        assert_eq!(cfg.timeline.default_timeframes.len(), 9);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["SOL"], "stream": { "max_reconnect_attempts": 2 },
                        "timeline": { "default_timeframes": ["1m", "1h"] } }"#;
        let cfg: FeedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["SOL"]);
        assert_eq!(cfg.stream.max_reconnect_attempts, 2);
        assert_eq!(cfg.stream.ping_interval_secs, 20);
        assert_eq!(
            cfg.timeline.default_timeframes,
            vec![Timeframe::M1, Timeframe::H1]
        );
        assert_eq!(cfg.rest.min_request_interval_ms, 1000);
    }

    #[test]
    fn unknown_timeframe_in_json_is_rejected() {
        let json = r#"{ "timeline": { "default_timeframes": ["2m"] } }"#;
        assert!(serde_json::from_str::<FeedConfig>(json).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let stream = StreamConfig::default();
        let delays: Vec<u64> = (1..=6).map(|n| stream.backoff_for(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(stream.backoff_for(200).as_secs(), 30);
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = FeedConfig::default();
        cfg.apply_overrides(lookup(&[
            (ENV_SYMBOLS, "sol, ada,,"),
            (ENV_TIMEFRAMES, "5m,4h"),
            (ENV_HISTORY, "720"),
        ]))
        .unwrap();
        assert_eq!(cfg.symbols, vec!["SOL", "ADA"]);
        assert_eq!(
            cfg.timeline.default_timeframes,
            vec![Timeframe::M5, Timeframe::H4]
        );
        assert_eq!(cfg.timeline.history_count, 720);
    }

    #[test]
    fn bad_env_override_is_an_error() {
        let mut cfg = FeedConfig::default();
        assert!(cfg.apply_overrides(lookup(&[(ENV_HISTORY, "lots")])).is_err());
        assert!(cfg.apply_overrides(lookup(&[(ENV_TIMEFRAMES, "1m,7m")])).is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let path = std::env::temp_dir().join(format!("kraken-feed-cfg-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "quote": "EUR" }"#).unwrap();
        let cfg = FeedConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.quote, "EUR");
        assert!(FeedConfig::load("/definitely/not/here.json").is_err());
    }
}
