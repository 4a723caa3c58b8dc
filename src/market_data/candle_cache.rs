// =============================================================================
// Candle Cache — TTL-bounded kline series with single-flight refetch
// =============================================================================
//
// A lookup is served from the store when the entry is younger than the
// interval's TTL and holds at least `limit` candles. Otherwise one fetch per
// key goes upstream and every concurrent caller for that key awaits the same
// shared future. A failed refetch leaves the old entry untouched and is
// reported to every waiter; stale candles are never substituted.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::candle::{CandleKey, CandleSeries};
use super::store::{CacheEntry, CandleStore};
use crate::error::ExchangeError;
use crate::okx::ExchangeApi;
use crate::types::{validate_kline_limit, Interval, Symbol};

type FetchResult = Result<Arc<CacheEntry>, ExchangeError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

// ---------------------------------------------------------------------------
// TTL table
// ---------------------------------------------------------------------------

/// Built-in TTL per interval; shorter bars go stale sooner.
pub fn default_ttl(interval: Interval) -> Duration {
    let secs = match interval {
        Interval::Minute1 => 10,
        Interval::Minute3 => 20,
        Interval::Minute5 => 30,
        Interval::Minute15 => 60,
        Interval::Minute30 => 120,
        Interval::Hour1 => 300,
        Interval::Hour2 => 600,
        Interval::Hour4 => 900,
        Interval::Hour6 => 1_200,
        Interval::Hour12 => 1_800,
        Interval::Day1 => 3_600,
        Interval::Week1 => 6 * 3_600,
        Interval::Month1 => 12 * 3_600,
        Interval::Month3 => 24 * 3_600,
    };
    Duration::from_secs(secs)
}

/// Per-interval TTL overrides on top of [`default_ttl`].
#[derive(Debug, Clone, Default)]
pub struct TtlTable {
    overrides: HashMap<Interval, Duration>,
}

impl TtlTable {
    pub fn from_secs(overrides: &BTreeMap<Interval, u64>) -> Self {
        Self {
            overrides: overrides
                .iter()
                .map(|(iv, secs)| (*iv, Duration::from_secs(*secs)))
                .collect(),
        }
    }

    /// Same TTL for every interval.
    #[cfg(test)]
    pub fn uniform(ttl: Duration) -> Self {
        Self {
            overrides: Interval::ALL.iter().map(|iv| (*iv, ttl)).collect(),
        }
    }

    pub fn ttl_for(&self, interval: Interval) -> Duration {
        self.overrides
            .get(&interval)
            .copied()
            .unwrap_or_else(|| default_ttl(interval))
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Where the candles in a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cache,
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedSeries {
    pub series: CandleSeries,
    pub source: Source,
}

/// Stored entry as-is, with staleness spelled out.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSeries {
    pub series: CandleSeries,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub stale: bool,
}

enum Lookup {
    Hit(Arc<CacheEntry>),
    Fetch(SharedFetch),
}

// ---------------------------------------------------------------------------
// CandleCache
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CandleCache {
    inner: Arc<Inner>,
}

struct Inner {
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn CandleStore>,
    ttl: TtlTable,
    in_flight: Mutex<HashMap<CandleKey, SharedFetch>>,
}

impl CandleCache {
    pub fn new(exchange: Arc<dyn ExchangeApi>, store: Arc<dyn CandleStore>, ttl: TtlTable) -> Self {
        Self {
            inner: Arc::new(Inner {
                exchange,
                store,
                ttl,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Most recent `limit` candles for `(symbol, interval)`.
    pub async fn get(
        &self,
        symbol: &Symbol,
        interval: Interval,
        limit: u32,
    ) -> Result<CachedSeries, ExchangeError> {
        let limit = validate_kline_limit(limit)? as usize;
        let key = CandleKey::new(symbol.clone(), interval);

        // May read from disk, so it runs before any lock is taken.
        let loaded = self.inner.store.load(&key).await;
        let fetch = match usable(loaded, limit) {
            Some(entry) => Lookup::Hit(entry),
            None => self.join_or_start(&key, limit),
        };

        match fetch {
            Lookup::Hit(entry) => {
                debug!(key = %key, limit, "candle cache hit");
                Ok(CachedSeries {
                    series: entry.series.most_recent(limit),
                    source: Source::Cache,
                })
            }
            Lookup::Fetch(fetch) => {
                let entry = fetch.await?;
                Ok(CachedSeries {
                    series: entry.series.most_recent(limit),
                    source: Source::Live,
                })
            }
        }
    }

    /// Stored entry for a key without touching upstream.
    pub async fn peek(&self, symbol: &Symbol, interval: Interval) -> Option<StoredSeries> {
        let key = CandleKey::new(symbol.clone(), interval);
        let entry = self.inner.store.load(&key).await?;
        Some(StoredSeries {
            series: entry.series.clone(),
            fetched_at: entry.fetched_at,
            ttl_secs: entry.ttl_secs,
            stale: !entry.is_fresh(Utc::now()),
        })
    }

    pub fn keys(&self) -> Vec<CandleKey> {
        self.inner.store.keys()
    }

    fn join_or_start(&self, key: &CandleKey, limit: usize) -> Lookup {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(fetch) = in_flight.get(key) {
            debug!(key = %key, "joining in-flight candle fetch");
            return Lookup::Fetch(fetch.clone());
        }
        // A fetch may have finished since the first check. Memory only: no
        // I/O while the in-flight map is locked.
        if let Some(entry) = usable(self.inner.store.cached(key), limit) {
            return Lookup::Hit(entry);
        }

        let fetch = Inner::refresh(self.inner.clone(), key.clone(), limit as u32)
            .boxed()
            .shared();
        in_flight.insert(key.clone(), fetch.clone());
        Lookup::Fetch(fetch)
    }
}

fn usable(entry: Option<Arc<CacheEntry>>, limit: usize) -> Option<Arc<CacheEntry>> {
    entry.filter(|e| e.is_fresh(Utc::now()) && e.series.len() >= limit)
}

/// Removes a key's in-flight slot once its fetch is over, however it ends.
struct InFlightSlot {
    inner: Arc<Inner>,
    key: CandleKey,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.key);
    }
}

impl Inner {
    /// Fetch upstream and replace the stored entry. The in-flight slot is
    /// cleared only after the store has been written.
    async fn refresh(inner: Arc<Inner>, key: CandleKey, limit: u32) -> FetchResult {
        let _slot = InFlightSlot {
            inner: inner.clone(),
            key: key.clone(),
        };

        debug!(key = %key, limit, "fetching candles upstream");
        let fetched = AssertUnwindSafe(inner.exchange.fetch_kline(&key.symbol, key.interval, limit))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(key = %key, "candle fetch panicked");
                Err(ExchangeError::Unavailable(format!(
                    "candle fetch for {key} failed unexpectedly"
                )))
            });

        let series = match fetched {
            Ok(series) => series,
            Err(e) => {
                warn!(key = %key, error = %e, "candle fetch failed, stored entry left untouched");
                return Err(e);
            }
        };

        if series.is_empty() {
            warn!(key = %key, "OKX returned no candles");
        }
        let entry = Arc::new(CacheEntry::new(series, inner.ttl.ttl_for(key.interval)));
        if let Err(e) = inner.store.store(key.clone(), entry.clone()).await {
            warn!(key = %key, error = %e, "failed to persist candle entry");
        }
        info!(key = %key, count = entry.series.len(), ttl_secs = entry.ttl_secs, "candle entry replaced");
        Ok(entry)
    }
}

impl std::fmt::Debug for CandleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleCache")
            .field("ttl", &self.inner.ttl)
            .field("in_flight", &self.inner.in_flight.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
