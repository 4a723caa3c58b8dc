// =============================================================================
// Central Application State — OKX Market Gateway
// =============================================================================
//
// Owns every long-lived component. Built once in `main` from the loaded
// `ServiceConfig` and shared with the HTTP layer as `Arc<AppState>`.
//
// Thread safety:
//   - The service and its collaborators manage their own interior
//     mutability (parking_lot locks, per-key futures).
//   - Configuration is read-only after startup; the extractors read the
//     consumer-header switch and the admin token from it per request.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use crate::market_data::{CandleCache, CandleStore, FileCandleStore, InMemoryCandleStore};
use crate::okx::{ExchangeApi, OkxClient};
use crate::rate_limit::RateLimiter;
use crate::runtime_config::ServiceConfig;
use crate::service::MarketDataService;
use crate::types::Symbol;

pub struct AppState {
    pub config: ServiceConfig,
    pub service: MarketDataService,
    /// Instant when the gateway was started. Used for uptime calculations.
    pub start_time: Instant,
}

impl AppState {
    /// Build the production wiring: OKX client, configured candle store and
    /// both rate-limit namespaces.
    pub fn build(config: ServiceConfig) -> Result<Self> {
        let client = OkxClient::new(
            config.okx_base_url.clone(),
            config.request_timeout(),
            config.retry_policy(),
        )?;

        let store: Arc<dyn CandleStore> = match &config.candle_store_dir {
            Some(dir) => {
                let store = FileCandleStore::open(dir)
                    .with_context(|| format!("failed to open candle store at {}", dir.display()))?;
                info!(dir = %dir.display(), "candle store: file-backed");
                Arc::new(store)
            }
            None => {
                info!("candle store: in-memory");
                Arc::new(InMemoryCandleStore::new())
            }
        };

        Ok(Self::with_components(config, Arc::new(client), store))
    }

    /// Wire the service around an arbitrary exchange and store.
    pub fn with_components(
        config: ServiceConfig,
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn CandleStore>,
    ) -> Self {
        let cache = CandleCache::new(exchange.clone(), store, config.ttl_table());
        let consumers = Arc::new(RateLimiter::new(
            "consumer",
            config.consumer_rate_limit.limit,
            config.consumer_rate_limit.window(),
        ));
        let upstream = Arc::new(RateLimiter::new(
            "upstream",
            config.upstream_rate_limit.limit,
            config.upstream_rate_limit.window(),
        ));

        // `validate` has already rejected bad entries in production.
        let popular_pairs = config
            .popular_pairs
            .iter()
            .filter_map(|raw| Symbol::parse(raw).ok())
            .collect();

        Self {
            service: MarketDataService::new(exchange, cache, consumers, upstream, popular_pairs),
            config,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
