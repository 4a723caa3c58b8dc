//! Scriptable in-process exchange used by the cache, service and API tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::error::ExchangeError;
use crate::market_data::{Candle, CandleSeries};
use crate::okx::models::PriceLevel;
use crate::okx::{ExchangeApi, Instrument, OrderBook, TickerSnapshot};
use crate::types::{validate_kline_limit, InstrumentType, Interval, Symbol};

/// Open time of the oldest candle the fake ever produces.
pub const BASE_OPEN_TIME: i64 = 1_700_000_000_000;

#[derive(Default)]
pub struct FakeExchange {
    calls: AtomicUsize,
    kline_calls: AtomicUsize,
    failures: Mutex<VecDeque<ExchangeError>>,
    delay: Mutex<Duration>,
    panic_next_kline: AtomicBool,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(delay: Duration) -> Self {
        let fake = Self::default();
        *fake.delay.lock() = delay;
        fake
    }

    /// Queue an error; the next call of any kind returns it.
    pub fn fail_next(&self, err: ExchangeError) {
        self.failures.lock().push_back(err);
    }

    /// The next `fetch_kline` panics instead of answering.
    pub fn panic_next_kline(&self) {
        self.panic_next_kline.store(true, Ordering::SeqCst);
    }

    /// Total upstream calls of any kind.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn kline_calls(&self) -> usize {
        self.kline_calls.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> Result<(), ExchangeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    async fn fetch_ticker(&self, symbol: &Symbol) -> Result<TickerSnapshot, ExchangeError> {
        self.begin().await?;
        Ok(TickerSnapshot {
            symbol: symbol.clone(),
            last_price: 100.0,
            bid_price: Some(99.5),
            ask_price: Some(100.5),
            timestamp: BASE_OPEN_TIME,
            open_24h: Some(95.0),
            high_24h: Some(105.0),
            low_24h: Some(90.0),
            vol_24h: Some(1_000.0),
        })
    }

    async fn fetch_order_book(&self, symbol: &Symbol, depth: u32) -> Result<OrderBook, ExchangeError> {
        self.begin().await?;
        let levels = depth.min(5) as usize;
        Ok(OrderBook {
            symbol: symbol.clone(),
            bids: (0..levels).map(|i| PriceLevel(99.0 - i as f64, 1.0)).collect(),
            asks: (0..levels).map(|i| PriceLevel(101.0 + i as f64, 1.0)).collect(),
            timestamp: BASE_OPEN_TIME,
        })
    }

    /// Produces `limit` candles in newest-first order, like OKX. Each call's
    /// closes are offset by the call number so refetches are distinguishable.
    async fn fetch_kline(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: u32,
    ) -> Result<CandleSeries, ExchangeError> {
        let limit = validate_kline_limit(limit)?;
        let generation = self.kline_calls.fetch_add(1, Ordering::SeqCst) as f64;
        self.begin().await?;
        if self.panic_next_kline.swap(false, Ordering::SeqCst) {
            panic!("scripted kline panic");
        }

        let step = interval.duration_ms();
        let candles = (0..limit as i64)
            .rev()
            .map(|i| {
                let close = 100.0 + i as f64 + generation * 1_000.0;
                Candle {
                    open_time: BASE_OPEN_TIME + i * step,
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 10.0,
                    close_time: BASE_OPEN_TIME + (i + 1) * step - 1,
                }
            })
            .collect();
        Ok(CandleSeries::from_unordered(symbol.clone(), interval, candles, Utc::now()))
    }

    async fn fetch_instruments(
        &self,
        instrument_type: InstrumentType,
    ) -> Result<Vec<Instrument>, ExchangeError> {
        self.begin().await?;
        Ok(vec![Instrument {
            instrument_id: "BTC-USDT".into(),
            instrument_type: instrument_type.as_okx_str().into(),
            base_currency: Some("BTC".into()),
            quote_currency: Some("USDT".into()),
            settle_currency: None,
            tick_size: 0.1,
            lot_size: 0.00000001,
            min_size: 0.00001,
            state: "live".into(),
        }])
    }

    async fn fetch_server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        self.begin().await?;
        Ok(Utc.timestamp_millis_opt(BASE_OPEN_TIME).unwrap())
    }
}
