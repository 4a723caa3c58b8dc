// =============================================================================
// Shared request types — validated symbols, intervals and instrument types
// =============================================================================
//
// Everything that reaches the exchange client has already passed through one
// of these constructors, so malformed input is rejected before any network
// call is attempted.
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;

/// Longest instrument id OKX hands out is well under this.
const MAX_SYMBOL_LEN: usize = 32;

/// Largest candle count accepted by `/api/v5/market/candles`.
pub const MAX_KLINE_LIMIT: u32 = 300;

/// Largest depth accepted by `/api/v5/market/books`.
pub const MAX_BOOK_DEPTH: u32 = 400;

// =============================================================================
// Symbol
// =============================================================================

/// Trading-pair identifier in OKX form, e.g. `BTC-USDT` or `BTC-USDT-SWAP`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Upper-case and validate a raw symbol string.
    pub fn parse(raw: &str) -> Result<Self, ExchangeError> {
        let normalized = raw.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(ExchangeError::InvalidArgument("symbol must not be empty".into()));
        }
        if normalized.len() > MAX_SYMBOL_LEN {
            return Err(ExchangeError::InvalidArgument(format!(
                "symbol '{raw}' is longer than {MAX_SYMBOL_LEN} characters"
            )));
        }
        if !normalized.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ExchangeError::InvalidArgument(format!(
                "symbol '{raw}' contains characters outside [A-Z0-9-]"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Symbol {
    type Error = ExchangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Symbol> for String {
    fn from(value: Symbol) -> Self {
        value.0
    }
}

// =============================================================================
// Interval
// =============================================================================

/// Candle bar size. The string forms are the OKX `bar` values.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    Minute1,
    Minute3,
    Minute5,
    Minute15,
    Minute30,
    Hour1,
    Hour2,
    Hour4,
    Hour6,
    Hour12,
    Day1,
    Week1,
    Month1,
    Month3,
}

impl Interval {
    pub const ALL: [Interval; 14] = [
        Interval::Minute1,
        Interval::Minute3,
        Interval::Minute5,
        Interval::Minute15,
        Interval::Minute30,
        Interval::Hour1,
        Interval::Hour2,
        Interval::Hour4,
        Interval::Hour6,
        Interval::Hour12,
        Interval::Day1,
        Interval::Week1,
        Interval::Month1,
        Interval::Month3,
    ];

    /// The `bar` query value OKX expects.
    pub fn as_okx_bar(&self) -> &'static str {
        match self {
            Self::Minute1 => "1m",
            Self::Minute3 => "3m",
            Self::Minute5 => "5m",
            Self::Minute15 => "15m",
            Self::Minute30 => "30m",
            Self::Hour1 => "1H",
            Self::Hour2 => "2H",
            Self::Hour4 => "4H",
            Self::Hour6 => "6H",
            Self::Hour12 => "12H",
            Self::Day1 => "1D",
            Self::Week1 => "1W",
            Self::Month1 => "1M",
            Self::Month3 => "3M",
        }
    }

    /// Bar length in milliseconds. Months are counted as 30 days.
    pub fn duration_ms(&self) -> i64 {
        const MIN: i64 = 60_000;
        const HOUR: i64 = 60 * MIN;
        const DAY: i64 = 24 * HOUR;
        match self {
            Self::Minute1 => MIN,
            Self::Minute3 => 3 * MIN,
            Self::Minute5 => 5 * MIN,
            Self::Minute15 => 15 * MIN,
            Self::Minute30 => 30 * MIN,
            Self::Hour1 => HOUR,
            Self::Hour2 => 2 * HOUR,
            Self::Hour4 => 4 * HOUR,
            Self::Hour6 => 6 * HOUR,
            Self::Hour12 => 12 * HOUR,
            Self::Day1 => DAY,
            Self::Week1 => 7 * DAY,
            Self::Month1 => 30 * DAY,
            Self::Month3 => 90 * DAY,
        }
    }
}

impl FromStr for Interval {
    type Err = ExchangeError;

    /// `m` is minutes and `M` is months, so only hour/day/week suffixes are
    /// matched case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let interval = match s.trim() {
            "1m" => Self::Minute1,
            "3m" => Self::Minute3,
            "5m" => Self::Minute5,
            "15m" => Self::Minute15,
            "30m" => Self::Minute30,
            "1H" | "1h" => Self::Hour1,
            "2H" | "2h" => Self::Hour2,
            "4H" | "4h" => Self::Hour4,
            "6H" | "6h" => Self::Hour6,
            "12H" | "12h" => Self::Hour12,
            "1D" | "1d" => Self::Day1,
            "1W" | "1w" => Self::Week1,
            "1M" => Self::Month1,
            "3M" => Self::Month3,
            other => {
                return Err(ExchangeError::InvalidArgument(format!(
                    "unsupported interval '{other}'"
                )))
            }
        };
        Ok(interval)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_okx_bar())
    }
}

impl TryFrom<String> for Interval {
    type Error = ExchangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.as_okx_bar().to_string()
    }
}

// =============================================================================
// InstrumentType
// =============================================================================

/// OKX `instType` values supported by the instruments listing.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentType {
    Spot,
    Margin,
    Swap,
    Futures,
}

impl InstrumentType {
    pub fn as_okx_str(&self) -> &'static str {
        match self {
            Self::Spot => "SPOT",
            Self::Margin => "MARGIN",
            Self::Swap => "SWAP",
            Self::Futures => "FUTURES",
        }
    }
}

impl Default for InstrumentType {
    fn default() -> Self {
        Self::Swap
    }
}

impl FromStr for InstrumentType {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SPOT" => Ok(Self::Spot),
            "MARGIN" => Ok(Self::Margin),
            "SWAP" => Ok(Self::Swap),
            "FUTURES" => Ok(Self::Futures),
            "OPTION" => Err(ExchangeError::InvalidArgument(
                "OPTION listings require an instrument family and are not supported".into(),
            )),
            other => Err(ExchangeError::InvalidArgument(format!(
                "unsupported instrument type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_okx_str())
    }
}

// =============================================================================
// Range checks
// =============================================================================

pub fn validate_kline_limit(limit: u32) -> Result<u32, ExchangeError> {
    if limit == 0 || limit > MAX_KLINE_LIMIT {
        return Err(ExchangeError::InvalidArgument(format!(
            "limit must be between 1 and {MAX_KLINE_LIMIT}, got {limit}"
        )));
    }
    Ok(limit)
}

pub fn validate_book_depth(depth: u32) -> Result<u32, ExchangeError> {
    if depth == 0 || depth > MAX_BOOK_DEPTH {
        return Err(ExchangeError::InvalidArgument(format!(
            "depth must be between 1 and {MAX_BOOK_DEPTH}, got {depth}"
        )));
    }
    Ok(depth)
}

// =============================================================================
// Tests
// =============================================================================
