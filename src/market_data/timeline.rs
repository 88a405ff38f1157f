use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle, from REST backfill or the live OHLC channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

// ---------------------------------------------------------------------------
// Timeline -- bounded, strictly ascending candle series
// ---------------------------------------------------------------------------

/// Candle history for one (symbol, timeframe).
///
/// Timestamps are strictly ascending and the length never exceeds `cap`;
/// once full, each append evicts the oldest candle.
#[derive(Debug, Clone)]
pub struct Timeline {
    candles: VecDeque<Candle>,
    cap: usize,
}

impl Timeline {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            candles: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }

    /// Build a timeline from backfilled history, keeping only the most recent
    /// `keep` candles (bounded by `cap`).
    ///
    /// Input order does not matter. For duplicate timestamps the candle that
    /// appears last in the input wins.
    pub fn from_history(mut history: Vec<Candle>, keep: usize, cap: usize) -> Self {
        let mut timeline = Self::new(cap);

        // Stable sort keeps input order among equal timestamps.
        history.sort_by_key(|c| c.timestamp);
        let mut deduped: Vec<Candle> = Vec::with_capacity(history.len());
        for candle in history {
            match deduped.last_mut() {
                Some(last) if last.timestamp == candle.timestamp => *last = candle,
                _ => deduped.push(candle),
            }
        }

        let keep = keep.min(timeline.cap);
        let start = deduped.len().saturating_sub(keep);
        timeline.candles.extend(deduped.into_iter().skip(start));
        timeline
    }

    /// Append a live candle.
    ///
    /// Returns `false` (and leaves the timeline untouched) when the candle is
    /// not strictly newer than the current last candle.
    pub fn push(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.candles.back() {
            if candle.timestamp <= last.timestamp {
                return false;
            }
        }
        self.candles.push_back(candle);
        while self.candles.len() > self.cap {
            self.candles.pop_front();
        }
        true
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn oldest(&self) -> Option<&Candle> {
        self.candles.front()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candle> {
        self.candles.iter()
    }

    /// Owned copy, oldest-first.
    pub fn to_vec(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(secs: i64, close: f64) -> Candle {
        let ts = Utc.timestamp_opt(secs, 0).unwrap();
        Candle::new(ts, close, close + 1.0, close - 1.0, close, 10.0)
    }

    fn is_strictly_ascending(t: &Timeline) -> bool {
        t.to_vec().windows(2).all(|w| w[0].timestamp < w[1].timestamp)
    }

    #[test]
    fn from_history_sorts_dedupes_and_keeps_most_recent() {
        let history = vec![
            candle(300, 3.0),
            candle(60, 1.0),
            candle(180, 2.0),
            candle(180, 2.5),
            candle(420, 4.0),
        ];
        let t = Timeline::from_history(history, 3, 1000);
        assert_eq!(t.len(), 3);
        assert!(is_strictly_ascending(&t));
        let closes: Vec<f64> = t.iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![2.5, 3.0, 4.0]);
    }

    #[test]
    fn from_history_is_bounded_by_cap() {
        let history: Vec<Candle> = (0..50).map(|i| candle(i * 60, i as f64)).collect();
        let t = Timeline::from_history(history, 40, 10);
        assert_eq!(t.len(), 10);
        assert_eq!(t.oldest().unwrap().close, 40.0);
        assert_eq!(t.latest().unwrap().close, 49.0);
    }

    #[test]
    fn push_appends_and_evicts_oldest() {
        let mut t = Timeline::new(3);
        for i in 0..5 {
            assert!(t.push(candle(i * 60, i as f64)));
        }
        assert_eq!(t.len(), 3);
        assert_eq!(t.oldest().unwrap().close, 2.0);
        assert_eq!(t.latest().unwrap().close, 4.0);
    }

    #[test]
    fn push_rejects_stale_and_duplicate_timestamps() {
        let mut t = Timeline::new(10);
        assert!(t.push(candle(120, 1.0)));
        assert!(!t.push(candle(120, 2.0)));
        assert!(!t.push(candle(60, 3.0)));
        assert_eq!(t.len(), 1);
        assert_eq!(t.latest().unwrap().close, 1.0);
    }

    #[test]
    fn zero_cap_is_clamped_to_one() {
        let mut t = Timeline::new(0);
        t.push(candle(1, 1.0));
        t.push(candle(2, 2.0));
        assert_eq!(t.len(), 1);
        assert_eq!(t.cap(), 1);
    }
}
