// =============================================================================
// Shared types used across the Kraken feed
// =============================================================================
//
// Timeframes, channel kinds and book depths are closed types, validated once
// when they enter the crate.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

// -----------------------------------------------------------------------------
// Timeframe
// -----------------------------------------------------------------------------

/// Candle granularity supported by Kraken's OHLC endpoints.
///
/// Variants are declared finest-first so the derived `Ord` sorts by duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    D15,
}

impl Timeframe {
    pub const ALL: [Timeframe; 9] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
        Self::W1,
        Self::D15,
    ];

    /// Interval in minutes, as Kraken expects it in `interval=`.
    pub fn minutes(self) -> u32 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 15,
            Self::M30 => 30,
            Self::H1 => 60,
            Self::H4 => 240,
            Self::D1 => 1440,
            Self::W1 => 10080,
            Self::D15 => 21600,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
            Self::D15 => "15d",
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|tf| tf.minutes() == minutes)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Timeframe {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|tf| tf.label() == wanted)
            .ok_or_else(|| {
                FeedError::InvalidParameter(format!(
                    "unsupported timeframe '{s}' (expected one of 1m, 5m, 15m, 30m, 1h, 4h, 1d, 1w, 15d)"
                ))
            })
    }
}

impl TryFrom<String> for Timeframe {
    type Error = FeedError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.label().to_string()
    }
}

// -----------------------------------------------------------------------------
// Book depth
// -----------------------------------------------------------------------------

/// Order-book depth accepted by the `book` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BookDepth(u32);

impl BookDepth {
    const ALLOWED: [u32; 5] = [10, 25, 100, 500, 1000];

    pub fn get(self) -> u32 {
        self.0
    }
}

impl Default for BookDepth {
    fn default() -> Self {
        Self(10)
    }
}

impl TryFrom<u32> for BookDepth {
    type Error = FeedError;

    fn try_from(depth: u32) -> Result<Self, Self::Error> {
        if Self::ALLOWED.contains(&depth) {
            Ok(Self(depth))
        } else {
            Err(FeedError::InvalidParameter(format!(
                "unsupported book depth {depth} (expected one of {:?})",
                Self::ALLOWED
            )))
        }
    }
}

impl From<BookDepth> for u32 {
    fn from(depth: BookDepth) -> Self {
        depth.0
    }
}

// -----------------------------------------------------------------------------
// Stream channels
// -----------------------------------------------------------------------------

/// A streaming channel together with its channel-specific parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "lowercase")]
pub enum Channel {
    Ticker,
    Ohlc { interval: Timeframe },
    Trade,
    Book { depth: BookDepth },
    Spread,
}

impl Channel {
    /// Wire name used in `params.channel` and in inbound `channel` tags.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ticker => "ticker",
            Self::Ohlc { .. } => "ohlc",
            Self::Trade => "trade",
            Self::Book { .. } => "book",
            Self::Spread => "spread",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ohlc { interval } => write!(f, "ohlc({interval})"),
            Self::Book { depth } => write!(f, "book({})", depth.get()),
            other => f.write_str(other.name()),
        }
    }
}

// -----------------------------------------------------------------------------
// Subscription / connection status
// -----------------------------------------------------------------------------

/// Lifecycle of one (channel, symbol) subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Errored,
    Closed,
}

impl SubscriptionStatus {
    /// Forward-only transition check: Pending → Active → {Errored, Closed},
    /// and Pending may fail straight to Errored or be closed before the ack.
    pub fn can_advance_to(self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Pending, Active) | (Pending, Errored) | (Pending, Closed) | (Active, Errored) | (Active, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Errored | Self::Closed)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Active => write!(f, "Active"),
            Self::Errored => write!(f, "Errored"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// State of the stream actor's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    GaveUp,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting { attempt } => write!(f, "Connecting(attempt={attempt})"),
            Self::Connected => write!(f, "Connected"),
            Self::GaveUp => write!(f, "GaveUp"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parses_labels_and_rejects_unknown() {
        assert_eq!("1m".parse::<Timeframe>().unwrap(), Timeframe::M1);
        assert_eq!(" 1H ".parse::<Timeframe>().unwrap(), Timeframe::H1);
        assert_eq!("15d".parse::<Timeframe>().unwrap(), Timeframe::D15);
        assert!(matches!(
            "2m".parse::<Timeframe>(),
            Err(FeedError::InvalidParameter(_))
        ));
    }

    #[test]
    fn timeframe_orders_finest_first() {
        let mut tfs = vec![Timeframe::H1, Timeframe::M5, Timeframe::M1, Timeframe::D1];
        tfs.sort();
        assert_eq!(tfs, vec![Timeframe::M1, Timeframe::M5, Timeframe::H1, Timeframe::D1]);
        assert_eq!(Timeframe::from_minutes(240), Some(Timeframe::H4));
        assert_eq!(Timeframe::from_minutes(2), None);
    }

    #[test]
    fn timeframe_serialises_as_label() {
        let json = serde_json::to_string(&Timeframe::M15).unwrap();
        assert_eq!(json, "\"15m\"");
        let back: Timeframe = serde_json::from_str("\"4h\"").unwrap();
        assert_eq!(back, Timeframe::H4);
        assert!(serde_json::from_str::<Timeframe>("\"3m\"").is_err());
    }

    #[test]
    fn book_depth_validates() {
        assert_eq!(BookDepth::try_from(25).unwrap().get(), 25);
        assert!(BookDepth::try_from(20).is_err());
        assert_eq!(BookDepth::default().get(), 10);
    }

    #[test]
    fn subscription_status_only_moves_forward() {
        use SubscriptionStatus::*;
        assert!(Pending.can_advance_to(Active));
        assert!(Active.can_advance_to(Closed));
        assert!(Active.can_advance_to(Errored));
        assert!(!Active.can_advance_to(Pending));
        assert!(!Closed.can_advance_to(Active));
        assert!(!Errored.can_advance_to(Pending));
        assert!(Closed.is_terminal());
    }
}
