// =============================================================================
// Kraken Feed — market-data library
// =============================================================================
//
// REST access (signed and public), a reconnecting WebSocket stream actor,
// symbol resolution and per-timeframe candle timelines.
// =============================================================================

pub mod error;
pub mod kraken;
pub mod market_data;
pub mod runtime_config;
pub mod types;

pub use error::{FeedError, FeedResult};
pub use market_data::{Candle, Timeline, TimelineStore};
pub use runtime_config::FeedConfig;
pub use types::{BookDepth, Channel, ConnectionState, SubscriptionStatus, Timeframe};
