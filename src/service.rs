// =============================================================================
// Market Data Service — admission, dispatch and response envelopes
// =============================================================================
//
// Every operation runs the same pipeline:
//   1. validate input (bad input costs no rate budget)
//   2. joint admission: consumer window, then the global upstream window
//   3. candle cache for klines, exchange client for everything else
//   4. map component failures onto the boundary taxonomy
//   5. wrap the payload as `{ data, asOf, source }`
//
// A request costs its consumer one unit. The upstream window is charged one
// unit per OKX call the request may make, so multi-instrument operations
// (popular pairs, bulk klines) pay for each instrument.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::market_data::{Candle, CandleCache, CandleKey, CandleSeries, Coverage, Source};
use crate::okx::{ExchangeApi, Instrument, OrderBook, TickerSnapshot};
use crate::rate_limit::{admit_all, RateLimiter, RateWindowSnapshot};
use crate::types::{validate_book_depth, validate_kline_limit, InstrumentType, Interval, Symbol};

/// Actor key of the single upstream window.
pub const UPSTREAM_ACTOR: &str = "okx";

/// Most instruments one bulk kline request may name.
pub const MAX_BULK_SYMBOLS: usize = 10;

const CONSUMER_COST: u32 = 1;

// =============================================================================
// Response payloads
// =============================================================================

/// `asOf` is when the data was obtained from OKX, which for cached candles is
/// the original fetch time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T> {
    pub data: T,
    pub as_of: DateTime<Utc>,
    pub source: Source,
}

impl<T> Envelope<T> {
    fn live(data: T) -> Self {
        Self {
            data,
            as_of: Utc::now(),
            source: Source::Live,
        }
    }

    fn cached(data: T, as_of: DateTime<Utc>) -> Self {
        Self {
            data,
            as_of,
            source: Source::Cache,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KlineData {
    pub symbol: Symbol,
    pub interval: Interval,
    pub candles: Vec<Candle>,
    pub coverage: Option<Coverage>,
}

impl From<CandleSeries> for KlineData {
    fn from(series: CandleSeries) -> Self {
        Self {
            symbol: series.symbol,
            interval: series.interval,
            candles: series.candles,
            coverage: series.coverage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentList {
    pub instruments: Vec<Instrument>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeStatus {
    pub exchange_time: DateTime<Utc>,
    pub local_time: DateTime<Utc>,
    /// `local - exchange`; positive when our clock runs ahead.
    pub clock_skew_ms: i64,
    pub rate_limits: Vec<RateWindowSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCandles {
    pub symbol: Symbol,
    pub interval: Interval,
    pub candles: Vec<Candle>,
    /// Span of the returned candles, after filtering.
    pub coverage: Option<Coverage>,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestCandle {
    pub symbol: Symbol,
    pub interval: Interval,
    pub candle: Candle,
    pub fetched_at: DateTime<Utc>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedKeys {
    pub keys: Vec<CandleKey>,
    pub total_count: usize,
}

/// One instrument of a multi-instrument request that could not be served.
#[derive(Debug, Clone, Serialize)]
pub struct ItemError {
    pub symbol: String,
    pub error: ApiError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingPairs {
    pub tickers: Vec<TickerSnapshot>,
    pub errors: Vec<ItemError>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkKlineItem {
    pub source: Source,
    pub as_of: DateTime<Utc>,
    #[serde(flatten)]
    pub kline: KlineData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkKlines {
    pub interval: Interval,
    pub limit: u32,
    pub results: Vec<BulkKlineItem>,
    pub errors: Vec<ItemError>,
    pub processed_symbols: usize,
}

/// Optional narrowing of a stored-candle read. Times are open times in ms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandleRange {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Keep only the most recent `limit` candles that match.
    pub limit: Option<u32>,
}

impl CandleRange {
    fn validate(self) -> Result<Self, ApiError> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start > end {
                return Err(ApiError::invalid_argument(format!(
                    "startTime {start} is after endTime {end}"
                )));
            }
        }
        if let Some(limit) = self.limit {
            validate_kline_limit(limit)?;
        }
        Ok(self)
    }

    fn apply(&self, candles: Vec<Candle>) -> Vec<Candle> {
        let start = self.start_time.unwrap_or(i64::MIN);
        let end = self.end_time.unwrap_or(i64::MAX);
        let mut kept: Vec<Candle> = candles
            .into_iter()
            .filter(|c| c.open_time >= start && c.open_time <= end)
            .collect();
        if let Some(limit) = self.limit {
            let skip = kept.len().saturating_sub(limit as usize);
            kept.drain(..skip);
        }
        kept
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitReset {
    pub namespace: &'static str,
    pub actor: String,
    pub reset: bool,
}

// =============================================================================
// MarketDataService
// =============================================================================

pub struct MarketDataService {
    exchange: Arc<dyn ExchangeApi>,
    cache: CandleCache,
    consumers: Arc<RateLimiter>,
    upstream: Arc<RateLimiter>,
    popular_pairs: Vec<Symbol>,
}

impl MarketDataService {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        cache: CandleCache,
        consumers: Arc<RateLimiter>,
        upstream: Arc<RateLimiter>,
        popular_pairs: Vec<Symbol>,
    ) -> Self {
        Self {
            exchange,
            cache,
            consumers,
            upstream,
            popular_pairs,
        }
    }

    /// Charge one request to `consumer` and `upstream_calls` units to the
    /// upstream window. Both or neither; `0` skips the upstream window.
    fn admit(&self, consumer: &str, upstream_calls: u32) -> Result<(), ApiError> {
        let admitted = if upstream_calls > 0 {
            admit_all(&[
                (self.consumers.as_ref(), consumer, CONSUMER_COST),
                (self.upstream.as_ref(), UPSTREAM_ACTOR, upstream_calls),
            ])
        } else {
            self.consumers.admit(consumer, CONSUMER_COST)
        };

        if admitted {
            Ok(())
        } else {
            Err(ApiError::rate_limited(
                "request rate exceeded, retry after the current window",
            ))
        }
    }

    pub async fn ticker(&self, consumer: &str, symbol: &str) -> Result<Envelope<TickerSnapshot>, ApiError> {
        let symbol = Symbol::parse(symbol)?;
        self.admit(consumer, 1)?;

        let ticker = self.exchange.fetch_ticker(&symbol).await?;
        Ok(Envelope::live(ticker))
    }

    pub async fn order_book(
        &self,
        consumer: &str,
        symbol: &str,
        depth: u32,
    ) -> Result<Envelope<OrderBook>, ApiError> {
        let symbol = Symbol::parse(symbol)?;
        let depth = validate_book_depth(depth)?;
        self.admit(consumer, 1)?;

        let book = self.exchange.fetch_order_book(&symbol, depth).await?;
        Ok(Envelope::live(book))
    }

    pub async fn kline(
        &self,
        consumer: &str,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Envelope<KlineData>, ApiError> {
        let symbol = Symbol::parse(symbol)?;
        let interval: Interval = interval.parse()?;
        let limit = validate_kline_limit(limit)?;
        self.admit(consumer, 1)?;

        let cached = self.cache.get(&symbol, interval, limit).await?;
        debug!(symbol = %symbol, interval = %interval, limit, source = ?cached.source, "kline served");

        Ok(Envelope {
            as_of: cached.series.fetched_at,
            data: cached.series.into(),
            source: cached.source,
        })
    }

    pub async fn instruments(
        &self,
        consumer: &str,
        instrument_type: &str,
    ) -> Result<Envelope<InstrumentList>, ApiError> {
        let instrument_type: InstrumentType = instrument_type.parse()?;
        self.admit(consumer, 1)?;

        let instruments = self.exchange.fetch_instruments(instrument_type).await?;
        Ok(Envelope::live(InstrumentList {
            total_count: instruments.len(),
            instruments,
        }))
    }

    /// OKX server time against ours, plus the current rate windows.
    pub async fn exchange_status(&self, consumer: &str) -> Result<Envelope<ExchangeStatus>, ApiError> {
        self.admit(consumer, 1)?;

        let exchange_time = self.exchange.fetch_server_time().await?;
        let local_time = Utc::now();
        let clock_skew_ms = (local_time - exchange_time).num_milliseconds();
        if clock_skew_ms.abs() > 1_000 {
            info!(clock_skew_ms, "local clock differs from OKX by more than 1s");
        }

        let rate_limits = [
            self.upstream.snapshot(UPSTREAM_ACTOR),
            self.consumers.snapshot(consumer),
        ]
        .into_iter()
        .flatten()
        .collect();

        Ok(Envelope::live(ExchangeStatus {
            exchange_time,
            local_time,
            clock_skew_ms,
            rate_limits,
        }))
    }

    /// Tickers for the configured popular pairs, fetched concurrently. Pairs
    /// that fail are listed under `errors`; the call only fails as a whole
    /// when every pair does.
    pub async fn trading_pairs(&self, consumer: &str) -> Result<Envelope<TradingPairs>, ApiError> {
        self.admit(consumer, self.popular_pairs.len() as u32)?;

        let results = join_all(self.popular_pairs.iter().map(|s| self.exchange.fetch_ticker(s))).await;

        let mut tickers = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for (symbol, result) in self.popular_pairs.iter().zip(results) {
            match result {
                Ok(ticker) => tickers.push(ticker),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "popular pair ticker failed");
                    errors.push(ItemError {
                        symbol: symbol.to_string(),
                        error: e.into(),
                    });
                }
            }
        }

        if tickers.is_empty() && !errors.is_empty() {
            return Err(errors.swap_remove(0).error);
        }

        Ok(Envelope::live(TradingPairs {
            total_count: tickers.len(),
            tickers,
            errors,
        }))
    }

    /// Klines for several instruments at one interval. Each instrument goes
    /// through the candle cache on its own, so hits, misses and failures are
    /// reported per instrument.
    pub async fn bulk_klines(
        &self,
        consumer: &str,
        symbols: &[String],
        interval: &str,
        limit: u32,
    ) -> Result<Envelope<BulkKlines>, ApiError> {
        let interval: Interval = interval.parse()?;
        let limit = validate_kline_limit(limit)?;
        if symbols.is_empty() || symbols.len() > MAX_BULK_SYMBOLS {
            return Err(ApiError::invalid_argument(format!(
                "symbols must list 1..={MAX_BULK_SYMBOLS} instruments"
            )));
        }

        let mut valid: Vec<Symbol> = Vec::with_capacity(symbols.len());
        let mut errors = Vec::new();
        for raw in symbols {
            match Symbol::parse(raw) {
                Ok(symbol) if !valid.contains(&symbol) => valid.push(symbol),
                Ok(_) => {}
                Err(e) => errors.push(ItemError {
                    symbol: raw.clone(),
                    error: e.into(),
                }),
            }
        }
        if valid.is_empty() {
            return Err(ApiError::invalid_argument("no valid symbols in request"));
        }
        self.admit(consumer, valid.len() as u32)?;

        let fetched = join_all(valid.iter().map(|s| self.cache.get(s, interval, limit))).await;

        let mut results = Vec::with_capacity(valid.len());
        for (symbol, outcome) in valid.iter().zip(fetched) {
            match outcome {
                Ok(cached) => results.push(BulkKlineItem {
                    source: cached.source,
                    as_of: cached.series.fetched_at,
                    kline: cached.series.into(),
                }),
                Err(e) => errors.push(ItemError {
                    symbol: symbol.to_string(),
                    error: e.into(),
                }),
            }
        }
        debug!(
            interval = %interval,
            limit,
            served = results.len(),
            failed = errors.len(),
            "bulk klines served"
        );

        let source = if results.iter().any(|r| r.source == Source::Live) {
            Source::Live
        } else {
            Source::Cache
        };
        let as_of = results.iter().map(|r| r.as_of).min().unwrap_or_else(Utc::now);

        Ok(Envelope {
            data: BulkKlines {
                interval,
                limit,
                processed_symbols: valid.len(),
                results,
                errors,
            },
            as_of,
            source,
        })
    }

    /// Whatever the cache holds for a key, stale or not, optionally narrowed
    /// by open time and count. Never reaches OKX.
    pub async fn stored_candles(
        &self,
        consumer: &str,
        symbol: &str,
        interval: &str,
        range: CandleRange,
    ) -> Result<Envelope<StoredCandles>, ApiError> {
        let symbol = Symbol::parse(symbol)?;
        let interval: Interval = interval.parse()?;
        let range = range.validate()?;
        self.admit(consumer, 0)?;

        let stored = self
            .cache
            .peek(&symbol, interval)
            .await
            .ok_or_else(|| ApiError::not_found(format!("no candles cached for {symbol}@{interval}")))?;

        let candles = range.apply(stored.series.candles);
        Ok(Envelope::cached(
            StoredCandles {
                symbol: stored.series.symbol,
                interval: stored.series.interval,
                coverage: Coverage::of(&candles),
                candles,
                fetched_at: stored.fetched_at,
                ttl_secs: stored.ttl_secs,
                stale: stored.stale,
            },
            stored.fetched_at,
        ))
    }

    /// Newest stored candle for a key. Never reaches OKX.
    pub async fn latest_candle(
        &self,
        consumer: &str,
        symbol: &str,
        interval: &str,
    ) -> Result<Envelope<LatestCandle>, ApiError> {
        let symbol = Symbol::parse(symbol)?;
        let interval: Interval = interval.parse()?;
        self.admit(consumer, 0)?;

        let no_candles = || ApiError::not_found(format!("no candles cached for {symbol}@{interval}"));
        let stored = self.cache.peek(&symbol, interval).await.ok_or_else(no_candles)?;
        let candle = stored.series.candles.last().cloned().ok_or_else(no_candles)?;

        Ok(Envelope::cached(
            LatestCandle {
                symbol: stored.series.symbol,
                interval: stored.series.interval,
                candle,
                fetched_at: stored.fetched_at,
                stale: stored.stale,
            },
            stored.fetched_at,
        ))
    }

    pub fn cached_keys(&self, consumer: &str) -> Result<Envelope<CachedKeys>, ApiError> {
        self.admit(consumer, 0)?;

        let mut keys = self.cache.keys();
        keys.sort();
        Ok(Envelope::cached(
            CachedKeys {
                total_count: keys.len(),
                keys,
            },
            Utc::now(),
        ))
    }

    /// Clear one actor's window in the `consumer` or `upstream` namespace.
    pub fn reset_rate_limit(&self, namespace: &str, actor: &str) -> Result<RateLimitReset, ApiError> {
        let (namespace, limiter) = match namespace {
            "consumer" => ("consumer", &self.consumers),
            "upstream" => ("upstream", &self.upstream),
            other => {
                return Err(ApiError::invalid_argument(format!(
                    "unknown rate-limit namespace '{other}'"
                )))
            }
        };
        if !limiter.reset(actor) {
            return Err(ApiError::not_found(format!("no {namespace} window for '{actor}'")));
        }
        Ok(RateLimitReset {
            namespace,
            actor: actor.to_string(),
            reset: true,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::{ErrorKind, ExchangeError};
    use crate::market_data::{InMemoryCandleStore, TtlTable};
    use crate::testing::{FakeExchange, BASE_OPEN_TIME};

    fn pairs() -> Vec<Symbol> {
        ["BTC-USDT", "ETH-USDT", "BNB-USDT", "ADA-USDT", "SOL-USDT"]
            .iter()
            .map(|s| Symbol::parse(s).unwrap())
            .collect()
    }

    fn service_with(
        fake: Arc<FakeExchange>,
        consumer_limit: u32,
        upstream_limit: u32,
    ) -> MarketDataService {
        let cache = CandleCache::new(
            fake.clone(),
            Arc::new(InMemoryCandleStore::new()),
            TtlTable::uniform(Duration::from_secs(300)),
        );
        MarketDataService::new(
            fake,
            cache,
            Arc::new(RateLimiter::new("consumer", consumer_limit, Duration::from_secs(60))),
            Arc::new(RateLimiter::new("upstream", upstream_limit, Duration::from_secs(60))),
            pairs(),
        )
    }

    #[tokio::test]
    async fn consumer_over_limit_is_rejected_without_upstream_call() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 2, 100);

        svc.ticker("alice", "BTC-USDT").await.unwrap();
        svc.ticker("alice", "BTC-USDT").await.unwrap();
        let err = svc.ticker("alice", "BTC-USDT").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(fake.calls(), 2);

        // Other consumers keep their own budget.
        svc.ticker("bob", "BTC-USDT").await.unwrap();
        assert_eq!(fake.calls(), 3);
    }

    #[tokio::test]
    async fn upstream_window_is_shared_by_all_consumers() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 2);

        svc.ticker("alice", "BTC-USDT").await.unwrap();
        svc.ticker("bob", "BTC-USDT").await.unwrap();
        let err = svc.ticker("carol", "BTC-USDT").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn invalid_input_costs_no_budget() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 1, 100);

        let err = svc.ticker("alice", "BTC/USDT").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let err = svc.kline("alice", "BTC-USDT", "7m", 10).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let err = svc.order_book("alice", "BTC-USDT", 0).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let err = svc.instruments("alice", "OPTION").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        assert_eq!(fake.calls(), 0);
        svc.ticker("alice", "btc-usdt").await.unwrap();
    }

    #[tokio::test]
    async fn kline_reports_live_then_cache() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        let first = svc.kline("alice", "BTC-USDT", "1H", 24).await.unwrap();
        assert_eq!(first.source, Source::Live);
        assert_eq!(first.data.candles.len(), 24);

        let second = svc.kline("alice", "BTC-USDT", "1h", 24).await.unwrap();
        assert_eq!(second.source, Source::Cache);
        assert_eq!(second.data.candles, first.data.candles);
        assert_eq!(fake.kline_calls(), 1);
    }

    #[tokio::test]
    async fn kline_cache_hits_still_charge_the_consumer() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 2, 100);

        svc.kline("alice", "BTC-USDT", "1H", 10).await.unwrap();
        svc.kline("alice", "BTC-USDT", "1H", 10).await.unwrap();
        let err = svc.kline("alice", "BTC-USDT", "1H", 10).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn component_failures_map_to_boundary_kinds() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        fake.fail_next(ExchangeError::Unavailable("timed out".into()));
        let err = svc.ticker("alice", "BTC-USDT").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);

        fake.fail_next(ExchangeError::UpstreamError {
            code: "51001".into(),
            msg: "Instrument ID does not exist".into(),
        });
        let err = svc.order_book("alice", "NOPE-USDT", 5).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UpstreamError);
        assert!(err.message.contains("51001"));

        fake.fail_next(ExchangeError::MalformedResponse("missing field `last`".into()));
        let err = svc.ticker("alice", "BTC-USDT").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(!err.message.contains("last"));
    }

    #[tokio::test]
    async fn stored_candles_is_not_found_until_fetched() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        let all = CandleRange::default();
        let err = svc.stored_candles("alice", "BTC-USDT", "1H", all).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        svc.kline("alice", "BTC-USDT", "1H", 12).await.unwrap();
        let stored = svc.stored_candles("alice", "BTC-USDT", "1H", all).await.unwrap();
        assert_eq!(stored.source, Source::Cache);
        assert_eq!(stored.data.candles.len(), 12);
        assert!(!stored.data.stale);
        assert_eq!(stored.data.ttl_secs, 300);
        assert_eq!(fake.kline_calls(), 1);
    }

    #[tokio::test]
    async fn stored_candles_only_charges_the_consumer() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 1);

        svc.kline("alice", "BTC-USDT", "1H", 5).await.unwrap();
        // Upstream window is now full, but reading stored candles still works.
        assert!(svc
            .stored_candles("alice", "BTC-USDT", "1H", CandleRange::default())
            .await
            .is_ok());
        assert!(svc.latest_candle("alice", "BTC-USDT", "1H").await.is_ok());
        assert!(svc.cached_keys("alice").is_ok());
        assert_eq!(
            svc.ticker("alice", "BTC-USDT").await.unwrap_err().kind,
            ErrorKind::RateLimited
        );
    }

    #[tokio::test]
    async fn cached_keys_lists_sorted_keys() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        svc.kline("alice", "ETH-USDT", "1m", 5).await.unwrap();
        svc.kline("alice", "BTC-USDT", "1H", 5).await.unwrap();

        let listed = svc.cached_keys("alice").unwrap().data;
        assert_eq!(listed.total_count, 2);
        assert_eq!(listed.keys[0].symbol.as_str(), "BTC-USDT");
        assert_eq!(listed.keys[1].symbol.as_str(), "ETH-USDT");
    }

    #[tokio::test]
    async fn instruments_default_and_count() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        let env = svc.instruments("alice", "spot").await.unwrap();
        assert_eq!(env.data.total_count, 1);
        assert_eq!(env.data.instruments[0].instrument_type, "SPOT");
        assert_eq!(env.source, Source::Live);
    }

    #[tokio::test]
    async fn exchange_status_reports_skew_and_windows() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        let status = svc.exchange_status("alice").await.unwrap().data;
        // The fake's clock is pinned in 2023, so ours runs ahead.
        assert!(status.clock_skew_ms > 0);
        assert_eq!(status.rate_limits.len(), 2);
        assert!(status.rate_limits.iter().all(|w| w.count == 1));
    }

    #[tokio::test]
    async fn cache_hit_as_of_is_the_original_fetch_time() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        let live = svc.kline("alice", "BTC-USDT", "1H", 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let hit = svc.kline("alice", "BTC-USDT", "1H", 10).await.unwrap();

        assert_eq!(hit.source, Source::Cache);
        assert_eq!(hit.as_of, live.as_of);

        let stored = svc
            .stored_candles("alice", "BTC-USDT", "1H", CandleRange::default())
            .await
            .unwrap();
        assert_eq!(stored.as_of, live.as_of);
        assert_eq!(stored.data.fetched_at, live.as_of);
    }

    #[tokio::test]
    async fn stored_candles_filter_by_time_and_limit() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);
        svc.kline("alice", "BTC-USDT", "1m", 10).await.unwrap();

        let minute = Interval::Minute1.duration_ms();
        let range = CandleRange {
            start_time: Some(BASE_OPEN_TIME + 2 * minute),
            end_time: Some(BASE_OPEN_TIME + 6 * minute),
            limit: None,
        };
        let stored = svc.stored_candles("alice", "BTC-USDT", "1m", range).await.unwrap().data;
        let opens: Vec<i64> = stored.candles.iter().map(|c| c.open_time).collect();
        assert_eq!(opens, (2..=6).map(|i| BASE_OPEN_TIME + i * minute).collect::<Vec<_>>());
        let coverage = stored.coverage.unwrap();
        assert_eq!(coverage.earliest, BASE_OPEN_TIME + 2 * minute);
        assert_eq!(coverage.latest, BASE_OPEN_TIME + 7 * minute - 1);

        let range = CandleRange {
            limit: Some(3),
            ..range
        };
        let stored = svc.stored_candles("alice", "BTC-USDT", "1m", range).await.unwrap().data;
        assert_eq!(stored.candles.len(), 3);
        assert_eq!(stored.candles[0].open_time, BASE_OPEN_TIME + 4 * minute);

        // Outside the stored span: found, but empty.
        let range = CandleRange {
            start_time: Some(0),
            end_time: Some(1),
            limit: None,
        };
        let stored = svc.stored_candles("alice", "BTC-USDT", "1m", range).await.unwrap().data;
        assert!(stored.candles.is_empty());
        assert!(stored.coverage.is_none());
    }

    #[tokio::test]
    async fn inverted_range_is_invalid_and_free() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 1, 100);

        let range = CandleRange {
            start_time: Some(10),
            end_time: Some(5),
            limit: None,
        };
        let err = svc.stored_candles("alice", "BTC-USDT", "1H", range).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        let range = CandleRange {
            limit: Some(0),
            ..CandleRange::default()
        };
        let err = svc.stored_candles("alice", "BTC-USDT", "1H", range).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        // The single unit of budget is still there.
        svc.ticker("alice", "BTC-USDT").await.unwrap();
    }

    #[tokio::test]
    async fn latest_candle_is_the_newest_stored() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        let err = svc.latest_candle("alice", "ETH-USDT", "5m").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let kline = svc.kline("alice", "ETH-USDT", "5m", 20).await.unwrap();
        let latest = svc.latest_candle("alice", "ETH-USDT", "5m").await.unwrap();
        assert_eq!(latest.source, Source::Cache);
        assert_eq!(latest.as_of, kline.as_of);
        assert_eq!(Some(&latest.data.candle), kline.data.candles.last());
        assert_eq!(fake.kline_calls(), 1);
    }

    #[tokio::test]
    async fn trading_pairs_returns_every_popular_pair() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        let env = svc.trading_pairs("alice").await.unwrap();
        assert_eq!(env.source, Source::Live);
        assert_eq!(env.data.total_count, 5);
        assert!(env.data.errors.is_empty());
        let symbols: Vec<&str> = env.data.tickers.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(symbols, ["BTC-USDT", "ETH-USDT", "BNB-USDT", "ADA-USDT", "SOL-USDT"]);
        assert_eq!(env.data.tickers[0].vol_24h, Some(1_000.0));
        assert_eq!(fake.calls(), 5);
    }

    #[tokio::test]
    async fn trading_pairs_keeps_going_past_a_failed_pair() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        fake.fail_next(ExchangeError::UpstreamError {
            code: "51001".into(),
            msg: "Instrument ID does not exist".into(),
        });
        let data = svc.trading_pairs("alice").await.unwrap().data;
        assert_eq!(data.total_count, 4);
        assert_eq!(data.errors.len(), 1);
        assert_eq!(data.errors[0].symbol, "BTC-USDT");
        assert_eq!(data.errors[0].error.kind, ErrorKind::UpstreamError);
    }

    #[tokio::test]
    async fn trading_pairs_charges_upstream_per_pair() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 7);

        svc.trading_pairs("alice").await.unwrap();
        let err = svc.trading_pairs("alice").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert_eq!(fake.calls(), 5);

        // The consumer paid once per request.
        assert_eq!(svc.consumers.snapshot("alice").unwrap().count, 1);
    }

    #[tokio::test]
    async fn bulk_klines_go_through_the_cache_one_key_each() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);
        svc.kline("alice", "BTC-USDT", "1H", 10).await.unwrap();

        let symbols = vec!["BTC-USDT".to_string(), "eth-usdt".to_string(), "BTC-USDT".to_string()];
        let env = svc.bulk_klines("alice", &symbols, "1H", 10).await.unwrap();

        assert_eq!(env.source, Source::Live);
        assert_eq!(env.data.processed_symbols, 2);
        assert!(env.data.errors.is_empty());
        assert_eq!(env.data.results[0].kline.symbol.as_str(), "BTC-USDT");
        assert_eq!(env.data.results[0].source, Source::Cache);
        assert_eq!(env.data.results[1].kline.symbol.as_str(), "ETH-USDT");
        assert_eq!(env.data.results[1].source, Source::Live);
        assert!(env.data.results.iter().all(|r| r.kline.candles.len() == 10));
        // One upstream fetch for ETH; BTC was already cached.
        assert_eq!(fake.kline_calls(), 2);
        assert_eq!(env.as_of, env.data.results[0].as_of);
    }

    #[tokio::test]
    async fn bulk_klines_report_errors_per_symbol() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 100, 100);

        fake.fail_next(ExchangeError::Unavailable("timed out".into()));
        let symbols = vec!["BTC-USDT".to_string(), "BAD/PAIR".to_string(), "SOL-USDT".to_string()];
        let data = svc.bulk_klines("alice", &symbols, "15m", 5).await.unwrap().data;

        assert_eq!(data.processed_symbols, 2);
        assert_eq!(data.results.len(), 1);
        assert_eq!(data.results[0].kline.symbol.as_str(), "SOL-USDT");
        let failed: Vec<(&str, ErrorKind)> =
            data.errors.iter().map(|e| (e.symbol.as_str(), e.error.kind)).collect();
        assert!(failed.contains(&("BAD/PAIR", ErrorKind::InvalidArgument)));
        assert!(failed.contains(&("BTC-USDT", ErrorKind::Unavailable)));
    }

    #[tokio::test]
    async fn bulk_klines_reject_bad_requests_before_admission() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 1, 100);

        let none: Vec<String> = Vec::new();
        let too_many: Vec<String> = (0..=MAX_BULK_SYMBOLS).map(|i| format!("C{i}-USDT")).collect();
        let only_bad = vec!["BTC USDT".to_string()];
        let one = vec!["BTC-USDT".to_string()];

        for (symbols, interval, limit) in [
            (&none, "1H", 10),
            (&too_many, "1H", 10),
            (&only_bad, "1H", 10),
            (&one, "7m", 10),
            (&one, "1H", 301),
        ] {
            let err = svc.bulk_klines("alice", symbols, interval, limit).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
        assert_eq!(fake.calls(), 0);
        svc.bulk_klines("alice", &one, "1H", 10).await.unwrap();
    }

    #[tokio::test]
    async fn reset_clears_a_consumer_window() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake.clone(), 1, 100);

        svc.ticker("alice", "BTC-USDT").await.unwrap();
        assert_eq!(
            svc.ticker("alice", "BTC-USDT").await.unwrap_err().kind,
            ErrorKind::RateLimited
        );

        let reset = svc.reset_rate_limit("consumer", "alice").unwrap();
        assert!(reset.reset);
        svc.ticker("alice", "BTC-USDT").await.unwrap();

        assert_eq!(
            svc.reset_rate_limit("consumer", "nobody").unwrap_err().kind,
            ErrorKind::NotFound
        );
        assert_eq!(
            svc.reset_rate_limit("billing", "alice").unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
        assert!(svc.reset_rate_limit("upstream", UPSTREAM_ACTOR).is_ok());
    }

    #[tokio::test]
    async fn envelope_serialises_camel_case() {
        let fake = Arc::new(FakeExchange::new());
        let svc = service_with(fake, 100, 100);

        let env = svc.ticker("alice", "BTC-USDT").await.unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["source"], "live");
        assert!(json["asOf"].is_string());
        assert_eq!(json["data"]["symbol"], "BTC-USDT");
        assert_eq!(json["data"]["lastPrice"], 100.0);
        assert_eq!(json["data"]["high24h"], 105.0);
    }
}
