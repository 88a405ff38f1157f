// =============================================================================
// Kraken WebSocket v2 messages — outbound control + inbound classification
// =============================================================================
//
// Outbound:  {"method":"subscribe","params":{"channel":"ohlc","symbol":["BTC/USD"],
//             "interval":1,"snapshot":true}}
// Inbound:   frames carrying `channel` are heartbeats, status or data;
//            frames carrying `method` are acks (subscribe/unsubscribe) or pong.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{FeedError, FeedResult};
use crate::market_data::Candle;
use crate::types::Channel;

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMethod {
    Subscribe,
    Unsubscribe,
}

impl std::fmt::Display for ControlMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// A subscribe/unsubscribe request for one channel over one or more pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub channel: Channel,
    /// Stream pair names, e.g. `BTC/USD`.
    pub symbols: Vec<String>,
    pub snapshot: bool,
}

impl SubscriptionRequest {
    pub fn new(channel: Channel, symbols: Vec<String>) -> Self {
        Self {
            channel,
            symbols,
            snapshot: true,
        }
    }

    pub fn to_message(&self, method: ControlMethod) -> ControlMessage {
        let (interval, depth) = match self.channel {
            Channel::Ohlc { interval } => (Some(interval.minutes()), None),
            Channel::Book { depth } => (None, Some(depth.get())),
            _ => (None, None),
        };
        ControlMessage {
            method,
            req_id: None,
            params: ControlParams {
                channel: self.channel.name().to_string(),
                symbol: self.symbols.clone(),
                snapshot: (method == ControlMethod::Subscribe).then_some(self.snapshot),
                interval,
                depth,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlMessage {
    pub method: ControlMethod,
    /// Echoed back by the exchange on the acknowledgement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<u64>,
    pub params: ControlParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlParams {
    pub channel: String,
    pub symbol: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

impl ControlMessage {
    pub fn with_req_id(mut self, req_id: u64) -> Self {
        self.req_id = Some(req_id);
        self
    }

    pub fn to_json(&self) -> FeedResult<String> {
        serde_json::to_string(self).map_err(|e| FeedError::InvalidParameter(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat,
    /// `channel == "status"`; carries the whole message.
    Status(Value),
    /// Any other channel; the message is forwarded verbatim.
    Data { channel: String, message: Value },
    Ack(AckMessage),
    Pong,
    Unhandled(Value),
}

/// Response to a subscribe/unsubscribe request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AckMessage {
    pub method: ControlMethod,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<AckResult>,
    /// Failed acks carry the symbol at the top level instead of in `result`.
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub req_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AckResult {
    pub channel: String,
    #[serde(default)]
    pub symbol: Option<String>,
}

impl AckMessage {
    pub fn channel(&self) -> Option<&str> {
        self.result.as_ref().map(|r| r.channel.as_str())
    }

    pub fn symbol(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.symbol.as_deref())
            .or(self.symbol.as_deref())
    }
}

/// Parse and classify one text frame.
pub fn classify(text: &str) -> FeedResult<Inbound> {
    let message: Value =
        serde_json::from_str(text).map_err(|e| FeedError::MalformedResponse(e.to_string()))?;

    if let Some(channel) = message.get("channel").and_then(Value::as_str) {
        return Ok(match channel {
            "heartbeat" => Inbound::Heartbeat,
            "status" => Inbound::Status(message),
            other => Inbound::Data {
                channel: other.to_string(),
                message,
            },
        });
    }

    match message.get("method").and_then(Value::as_str) {
        Some("subscribe") | Some("unsubscribe") => {
            let ack: AckMessage = serde_json::from_value(message)
                .map_err(|e| FeedError::MalformedResponse(format!("bad ack: {e}")))?;
            Ok(Inbound::Ack(ack))
        }
        Some("pong") => Ok(Inbound::Pong),
        _ => Ok(Inbound::Unhandled(message)),
    }
}

// ---------------------------------------------------------------------------
// OHLC channel payload
// ---------------------------------------------------------------------------

/// One entry of an `ohlc` channel message's `data` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcTick {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub vwap: Option<f64>,
    #[serde(default)]
    pub trades: Option<u64>,
    #[serde(default)]
    pub interval_begin: Option<DateTime<Utc>>,
    /// Interval in minutes.
    #[serde(default)]
    pub interval: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl OhlcTick {
    /// Candle timestamp: the tick's `timestamp`, else `interval_begin`, else `now`.
    pub fn candle_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp.or(self.interval_begin).unwrap_or(now)
    }

    pub fn to_candle(&self, now: DateTime<Utc>) -> Candle {
        Candle::new(
            self.candle_time(now),
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
    }
}

/// Every well-formed tick in an `ohlc` message. Malformed entries are skipped.
pub fn ohlc_ticks(message: &Value) -> Vec<OhlcTick> {
    let Some(entries) = message.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match OhlcTick::deserialize(entry) {
            Ok(tick) => Some(tick),
            Err(e) => {
                warn!(error = %e, "skipping malformed ohlc entry");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
