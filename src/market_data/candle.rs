use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Interval, Symbol};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle. Times are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: Symbol,
    pub interval: Interval,
}

impl CandleKey {
    pub fn new(symbol: Symbol, interval: Interval) -> Self {
        Self { symbol, interval }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// `[earliest open, latest close]` of the candles it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coverage {
    pub earliest: i64,
    pub latest: i64,
}

impl Coverage {
    /// `None` for an empty slice. Expects ascending candles.
    pub fn of(candles: &[Candle]) -> Option<Self> {
        match (candles.first(), candles.last()) {
            (Some(first), Some(last)) => Some(Self {
                earliest: first.open_time,
                latest: last.close_time,
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// CandleSeries
// ---------------------------------------------------------------------------

/// Candles for one `(symbol, interval)`, ascending by `open_time` with no
/// duplicate open times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandleSeries {
    pub symbol: Symbol,
    pub interval: Interval,
    pub candles: Vec<Candle>,
    pub fetched_at: DateTime<Utc>,
    pub coverage: Option<Coverage>,
}

impl CandleSeries {
    /// Build a series from candles in any order. Sorts ascending and keeps the
    /// first candle seen for each open time.
    pub fn from_unordered(
        symbol: Symbol,
        interval: Interval,
        mut candles: Vec<Candle>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);

        Self {
            symbol,
            interval,
            coverage: Coverage::of(&candles),
            candles,
            fetched_at,
        }
    }

    pub fn key(&self) -> CandleKey {
        CandleKey::new(self.symbol.clone(), self.interval)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Copy of the series holding only the most recent `count` candles.
    /// `fetched_at` is kept; `coverage` is narrowed to the returned candles.
    pub fn most_recent(&self, count: usize) -> CandleSeries {
        let start = self.candles.len().saturating_sub(count);
        let candles = self.candles[start..].to_vec();
        CandleSeries {
            symbol: self.symbol.clone(),
            interval: self.interval,
            coverage: Coverage::of(&candles),
            candles,
            fetched_at: self.fetched_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
