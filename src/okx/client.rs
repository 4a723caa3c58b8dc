// =============================================================================
// OKX REST Client — public market data with bounded retries
// =============================================================================
//
// Only unauthenticated `/api/v5/market` and `/api/v5/public` endpoints are
// used. Every request carries the configured timeout. Connect errors,
// timeouts and 5xx answers are retried with exponential backoff; everything
// else (4xx, OKX error codes, unparseable bodies) fails on the first attempt.
// =============================================================================

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, error, instrument, warn};

use crate::error::ExchangeError;
use crate::market_data::CandleSeries;
use crate::types::{validate_book_depth, validate_kline_limit, InstrumentType, Interval, Symbol};

use super::models::{
    candle_from_row, Instrument, OrderBook, RawCandle, RawEnvelope, RawInstrument, RawOrderBook,
    RawServerTime, RawTicker, TickerSnapshot,
};

/// Production OKX endpoint.
pub const DEFAULT_BASE_URL: &str = "https://www.okx.com";

/// Longest slice of an error body carried into an error message.
const MAX_ERROR_BODY: usize = 200;

// =============================================================================
// ExchangeApi
// =============================================================================

/// Public market-data operations of the upstream exchange.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError>;

    async fn fetch_order_book(&self, symbol: &Symbol, depth: u32) -> Result<OrderBook, ExchangeError>;

    /// Series comes back ascending by open time.
    async fn fetch_kline(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: u32,
    ) -> Result<CandleSeries, ExchangeError>;

    async fn fetch_instruments(
        &self,
        instrument_type: InstrumentType,
    ) -> Result<Vec<Instrument>, ExchangeError>;

    async fn fetch_server_time(&self) -> Result<DateTime<Utc>, ExchangeError>;
}

// =============================================================================
// RetryPolicy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Sleep before retry number `attempt` (0-based): `base * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(200),
        }
    }
}

// =============================================================================
// OkxClient
// =============================================================================

#[derive(Clone)]
pub struct OkxClient {
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl OkxClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, timeout_ms = timeout.as_millis() as u64, "OkxClient initialised");

        Ok(Self {
            base_url,
            client,
            retry,
        })
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// GET `path` and decode `data` as `Vec<T>`, retrying transient failures.
    async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ExchangeError> {
        let mut attempt = 0;
        loop {
            match self.get_once(path, query).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        path,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient OKX failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_error(path, e))?;

        if status.is_server_error() {
            return Err(ExchangeError::Unavailable(format!("GET {path} returned {status}")));
        }

        let envelope: RawEnvelope = match serde_json::from_str(&body) {
            Ok(env) => env,
            Err(_) if !status.is_success() => {
                return Err(ExchangeError::UpstreamError {
                    code: status.as_u16().to_string(),
                    msg: truncate(&body),
                })
            }
            Err(e) => {
                error!(path, error = %e, "OKX success body is not a valid envelope");
                return Err(ExchangeError::MalformedResponse(format!("GET {path}: {e}")));
            }
        };

        if envelope.code != "0" {
            return Err(ExchangeError::UpstreamError {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        if !status.is_success() {
            return Err(ExchangeError::UpstreamError {
                code: status.as_u16().to_string(),
                msg: envelope.msg,
            });
        }

        serde_json::from_value(envelope.data).map_err(|e| {
            error!(path, error = %e, "OKX data does not match the expected schema");
            ExchangeError::MalformedResponse(format!("GET {path}: {e}"))
        })
    }
}

fn transport_error(path: &str, e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Unavailable(format!("GET {path} timed out"))
    } else {
        ExchangeError::Unavailable(format!("GET {path} failed: {e}"))
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

/// `data` arrays that should hold exactly one element.
fn first<T>(mut data: Vec<T>, path: &str) -> Result<T, ExchangeError> {
    if data.is_empty() {
        error!(path, "OKX returned an empty data array");
        return Err(ExchangeError::MalformedResponse(format!("GET {path}: empty data")));
    }
    Ok(data.swap_remove(0))
}

fn logged<T>(result: Result<T, ExchangeError>) -> Result<T, ExchangeError> {
    if let Err(ExchangeError::MalformedResponse(detail)) = &result {
        error!(detail = %detail, "malformed OKX payload");
    }
    result
}

// =============================================================================
// Public market data
// =============================================================================

#[async_trait]
impl ExchangeApi for OkxClient {
    /// GET /api/v5/market/ticker
    #[instrument(skip(self, symbol), fields(symbol = %symbol), name = "okx::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        const PATH: &str = "/api/v5/market/ticker";
        let data: Vec<RawTicker> = self
            .get_data(PATH, &[("instId", symbol.to_string())])
            .await?;
        let ticker = logged(first(data, PATH)?.into_snapshot())?;
        debug!(last = ticker.last_price, "ticker fetched");
        Ok(ticker)
    }

    /// GET /api/v5/market/books
    #[instrument(skip(self, symbol), fields(symbol = %symbol), name = "okx::fetch_order_book")]
    async fn fetch_order_book(&self, symbol: &Symbol, depth: u32) -> Result<OrderBook, ExchangeError> {
        const PATH: &str = "/api/v5/market/books";
        let depth = validate_book_depth(depth)?;
        let data: Vec<RawOrderBook> = self
            .get_data(PATH, &[("instId", symbol.to_string()), ("sz", depth.to_string())])
            .await?;
        let book = logged(first(data, PATH)?.into_order_book(symbol.clone()))?;
        debug!(bids = book.bids.len(), asks = book.asks.len(), "order book fetched");
        Ok(book)
    }

    /// GET /api/v5/market/candles
    ///
    /// OKX returns rows newest-first:
    ///   [0] ts, [1] o, [2] h, [3] l, [4] c, [5] vol, [6] volCcy,
    ///   [7] volCcyQuote, [8] confirm
    #[instrument(skip(self, symbol, interval), fields(symbol = %symbol, interval = %interval), name = "okx::fetch_kline")]
    async fn fetch_kline(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: u32,
    ) -> Result<CandleSeries, ExchangeError> {
        const PATH: &str = "/api/v5/market/candles";
        let limit = validate_kline_limit(limit)?;
        let rows: Vec<RawCandle> = self
            .get_data(
                PATH,
                &[
                    ("instId", symbol.to_string()),
                    ("bar", interval.as_okx_bar().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let candles = logged(
            rows.iter()
                .map(|row| candle_from_row(row, interval))
                .collect::<Result<Vec<_>, _>>(),
        )?;

        let series = CandleSeries::from_unordered(symbol.clone(), interval, candles, Utc::now());
        debug!(count = series.len(), "klines fetched");
        Ok(series)
    }

    /// GET /api/v5/public/instruments
    #[instrument(skip(self), name = "okx::fetch_instruments")]
    async fn fetch_instruments(
        &self,
        instrument_type: InstrumentType,
    ) -> Result<Vec<Instrument>, ExchangeError> {
        const PATH: &str = "/api/v5/public/instruments";
        let data: Vec<RawInstrument> = self
            .get_data(PATH, &[("instType", instrument_type.as_okx_str().to_string())])
            .await?;
        let instruments = logged(
            data.into_iter()
                .map(RawInstrument::into_instrument)
                .collect::<Result<Vec<_>, _>>(),
        )?;
        debug!(count = instruments.len(), "instruments fetched");
        Ok(instruments)
    }

    /// GET /api/v5/public/time
    #[instrument(skip(self), name = "okx::fetch_server_time")]
    async fn fetch_server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        const PATH: &str = "/api/v5/public/time";
        let data: Vec<RawServerTime> = self.get_data(PATH, &[]).await?;
        let millis = logged(first(data, PATH)?.into_millis())?;
        Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
            error!(millis, "OKX server time out of range");
            ExchangeError::MalformedResponse(format!("server time {millis} out of range"))
        })
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
