// =============================================================================
// OKX v5 wire formats and the normalised market-data types built from them
// =============================================================================
//
// OKX wraps every public response as `{ "code": "0", "msg": "", "data": [..] }`
// and sends numbers as strings. Raw structs mirror that shape exactly; the
// `into_*` conversions turn strings into numbers and fail with
// `MalformedResponse` instead of defaulting.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::market_data::Candle;
use crate::types::{Interval, Symbol};

// =============================================================================
// Envelope
// =============================================================================

/// Outer OKX response shape. `data` is decoded in a second step so that an
/// error payload with an empty or odd `data` still yields its `code`/`msg`.
#[derive(Debug, Deserialize)]
pub(crate) struct RawEnvelope {
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// =============================================================================
// Raw payloads
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawTicker {
    pub inst_id: String,
    pub last: String,
    pub ask_px: String,
    pub bid_px: String,
    pub ts: String,
    #[serde(default, rename = "open24h")]
    pub open_24h: String,
    #[serde(default, rename = "high24h")]
    pub high_24h: String,
    #[serde(default, rename = "low24h")]
    pub low_24h: String,
    #[serde(default, rename = "vol24h")]
    pub vol_24h: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawOrderBook {
    pub asks: Vec<Vec<String>>,
    pub bids: Vec<Vec<String>>,
    pub ts: String,
}

/// `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`, newest first.
pub(crate) type RawCandle = Vec<String>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawInstrument {
    pub inst_id: String,
    pub inst_type: String,
    #[serde(default)]
    pub base_ccy: String,
    #[serde(default)]
    pub quote_ccy: String,
    #[serde(default)]
    pub settle_ccy: String,
    pub tick_sz: String,
    pub lot_sz: String,
    pub min_sz: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawServerTime {
    pub ts: String,
}

// =============================================================================
// Normalised types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerSnapshot {
    pub symbol: Symbol,
    pub last_price: f64,
    /// `None` when the book side is empty.
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub timestamp: i64,
    /// Rolling 24h session; `None` when OKX leaves the field blank.
    #[serde(rename = "open24h")]
    pub open_24h: Option<f64>,
    #[serde(rename = "high24h")]
    pub high_24h: Option<f64>,
    #[serde(rename = "low24h")]
    pub low_24h: Option<f64>,
    /// Base-currency volume.
    #[serde(rename = "vol24h")]
    pub vol_24h: Option<f64>,
}

/// `[price, size]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceLevel(pub f64, pub f64);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBook {
    pub symbol: Symbol,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub instrument_id: String,
    pub instrument_type: String,
    pub base_currency: Option<String>,
    pub quote_currency: Option<String>,
    pub settle_currency: Option<String>,
    pub tick_size: f64,
    pub lot_size: f64,
    pub min_size: f64,
    pub state: String,
}

// =============================================================================
// Conversions
// =============================================================================

fn malformed(field: &str, value: &str) -> ExchangeError {
    ExchangeError::MalformedResponse(format!("field {field} is not numeric: '{value}'"))
}

fn parse_f64(value: &str, field: &str) -> Result<f64, ExchangeError> {
    value.parse::<f64>().map_err(|_| malformed(field, value))
}

fn parse_i64(value: &str, field: &str) -> Result<i64, ExchangeError> {
    value.parse::<i64>().map_err(|_| malformed(field, value))
}

/// Empty string means "no value"; anything else must be numeric.
fn parse_opt_f64(value: &str, field: &str) -> Result<Option<f64>, ExchangeError> {
    if value.is_empty() {
        Ok(None)
    } else {
        parse_f64(value, field).map(Some)
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl RawTicker {
    pub fn into_snapshot(self) -> Result<TickerSnapshot, ExchangeError> {
        let symbol = Symbol::parse(&self.inst_id)
            .map_err(|_| ExchangeError::MalformedResponse(format!("bad instId '{}'", self.inst_id)))?;
        Ok(TickerSnapshot {
            symbol,
            last_price: parse_f64(&self.last, "last")?,
            bid_price: parse_opt_f64(&self.bid_px, "bidPx")?,
            ask_price: parse_opt_f64(&self.ask_px, "askPx")?,
            timestamp: parse_i64(&self.ts, "ts")?,
            open_24h: parse_opt_f64(&self.open_24h, "open24h")?,
            high_24h: parse_opt_f64(&self.high_24h, "high24h")?,
            low_24h: parse_opt_f64(&self.low_24h, "low24h")?,
            vol_24h: parse_opt_f64(&self.vol_24h, "vol24h")?,
        })
    }
}

fn parse_levels(raw: Vec<Vec<String>>, side: &str) -> Result<Vec<PriceLevel>, ExchangeError> {
    raw.into_iter()
        .map(|level| match level.as_slice() {
            [price, size, ..] => Ok(PriceLevel(parse_f64(price, side)?, parse_f64(size, side)?)),
            _ => Err(ExchangeError::MalformedResponse(format!(
                "{side} level has {} elements",
                level.len()
            ))),
        })
        .collect()
}

impl RawOrderBook {
    pub fn into_order_book(self, symbol: Symbol) -> Result<OrderBook, ExchangeError> {
        Ok(OrderBook {
            symbol,
            bids: parse_levels(self.bids, "bids")?,
            asks: parse_levels(self.asks, "asks")?,
            timestamp: parse_i64(&self.ts, "ts")?,
        })
    }
}

/// Convert one kline row. OKX has no close time, so it is derived from the
/// bar length.
pub(crate) fn candle_from_row(row: &RawCandle, interval: Interval) -> Result<Candle, ExchangeError> {
    let [ts, open, high, low, close, volume, ..] = row.as_slice() else {
        return Err(ExchangeError::MalformedResponse(format!(
            "kline row has {} elements, expected at least 6",
            row.len()
        )));
    };
    let open_time = parse_i64(ts, "kline.ts")?;
    let close_time = open_time
        .checked_add(interval.duration_ms() - 1)
        .ok_or_else(|| ExchangeError::MalformedResponse(format!("kline ts {open_time} out of range")))?;
    Ok(Candle {
        open_time,
        open: parse_f64(open, "kline.o")?,
        high: parse_f64(high, "kline.h")?,
        low: parse_f64(low, "kline.l")?,
        close: parse_f64(close, "kline.c")?,
        volume: parse_f64(volume, "kline.vol")?,
        close_time,
    })
}

impl RawInstrument {
    pub fn into_instrument(self) -> Result<Instrument, ExchangeError> {
        Ok(Instrument {
            tick_size: parse_f64(&self.tick_sz, "tickSz")?,
            lot_size: parse_f64(&self.lot_sz, "lotSz")?,
            min_size: parse_f64(&self.min_sz, "minSz")?,
            instrument_id: self.inst_id,
            instrument_type: self.inst_type,
            base_currency: non_empty(self.base_ccy),
            quote_currency: non_empty(self.quote_ccy),
            settle_currency: non_empty(self.settle_ccy),
            state: self.state,
        })
    }
}

impl RawServerTime {
    pub fn into_millis(self) -> Result<i64, ExchangeError> {
        parse_i64(&self.ts, "ts")
    }
}

// =============================================================================
// Tests
// =============================================================================
