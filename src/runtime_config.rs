// =============================================================================
// Service Configuration — gateway settings loaded from JSON + environment
// =============================================================================
//
// Every tunable of the gateway lives here: upstream endpoint and timeouts,
// retry policy, both rate-limit namespaces, consumer identity, candle TTLs,
// the optional on-disk candle store, the popular-pairs list and the admin
// token.
//
// All fields carry `#[serde(default)]` so a partial (or empty) config file
// loads cleanly.  A handful of deployment-specific values can be overridden
// from the environment after the file is read.
//
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::TtlTable;
use crate::okx::{RetryPolicy, DEFAULT_BASE_URL};
use crate::types::{Interval, Symbol};

pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "gateway_config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_okx_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_base_ms() -> u64 {
    200
}

fn default_upstream_rate_limit() -> RateLimitConfig {
    // OKX public market endpoints: 20 requests / 2 s per IP.
    RateLimitConfig {
        limit: 20,
        window_secs: 2,
    }
}

fn default_consumer_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        limit: 10,
        window_secs: 5,
    }
}

fn default_popular_pairs() -> Vec<String> {
    ["BTC-USDT", "ETH-USDT", "BNB-USDT", "ADA-USDT", "SOL-USDT"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Upper bound on `popular_pairs`; each pair is one upstream call.
pub const MAX_POPULAR_PAIRS: usize = 20;

// =============================================================================
// RateLimitConfig
// =============================================================================

/// One fixed-window namespace: `limit` requests per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

// =============================================================================
// ServiceConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// OKX REST root, without the `/api/v5` suffix.
    #[serde(default = "default_okx_base_url")]
    pub okx_base_url: String,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Per-attempt upstream timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Extra attempts after the first for transient upstream failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    // --- Rate limits ---------------------------------------------------------

    #[serde(default = "default_upstream_rate_limit")]
    pub upstream_rate_limit: RateLimitConfig,

    #[serde(default = "default_consumer_rate_limit")]
    pub consumer_rate_limit: RateLimitConfig,

    /// Rate-limit by the `X-Consumer-Id` header instead of the peer IP. Only
    /// safe behind a proxy that sets the header itself; otherwise any caller
    /// can rotate it to get a fresh window.
    #[serde(default)]
    pub trust_consumer_header: bool,

    // --- Candle cache --------------------------------------------------------

    /// TTL overrides keyed by OKX bar (`"1m"`, `"1H"`, ...). Intervals not
    /// listed keep their built-in TTL.
    #[serde(default)]
    pub candle_ttl_secs: BTreeMap<Interval, u64>,

    /// When set, candle entries are persisted here as JSON.
    #[serde(default)]
    pub candle_store_dir: Option<PathBuf>,

    // --- Extras --------------------------------------------------------------

    /// Instruments served by `/trading-pairs`.
    #[serde(default = "default_popular_pairs")]
    pub popular_pairs: Vec<String>,

    /// Bearer token for the admin endpoints. Unset disables them.
    #[serde(default, skip_serializing)]
    pub admin_token: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            okx_base_url: default_okx_base_url(),
            bind_addr: default_bind_addr(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            upstream_rate_limit: default_upstream_rate_limit(),
            consumer_rate_limit: default_consumer_rate_limit(),
            candle_ttl_secs: BTreeMap::new(),
            trust_consumer_header: false,
            candle_store_dir: None,
            popular_pairs: default_popular_pairs(),
            admin_token: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read service config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse service config from {}", path.display()))?;

        info!(
            path = %path.display(),
            okx_base_url = %config.okx_base_url,
            bind_addr = %config.bind_addr,
            "service config loaded"
        );

        Ok(config)
    }

    /// Apply `OKX_BASE_URL`, `GATEWAY_BIND_ADDR`, `GATEWAY_CANDLE_STORE_DIR`,
    /// `GATEWAY_TRUST_CONSUMER_HEADER` and `GATEWAY_ADMIN_TOKEN` from the
    /// process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("OKX_BASE_URL") {
            self.okx_base_url = url;
        }
        if let Some(addr) = non_empty("GATEWAY_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(dir) = non_empty("GATEWAY_CANDLE_STORE_DIR") {
            self.candle_store_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = non_empty("GATEWAY_TRUST_CONSUMER_HEADER") {
            self.trust_consumer_header = matches!(flag.trim(), "1" | "true" | "TRUE" | "yes");
        }
        if let Some(token) = non_empty("GATEWAY_ADMIN_TOKEN") {
            self.admin_token = Some(token.trim().to_string());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.okx_base_url.trim().is_empty() {
            bail!("okx_base_url must not be empty");
        }
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be greater than zero");
        }
        for (name, rl) in [
            ("upstream_rate_limit", &self.upstream_rate_limit),
            ("consumer_rate_limit", &self.consumer_rate_limit),
        ] {
            if rl.limit == 0 {
                bail!("{name}.limit must be greater than zero");
            }
            if rl.window_secs == 0 {
                bail!("{name}.window_secs must be greater than zero");
            }
        }
        if self.popular_pairs.is_empty() || self.popular_pairs.len() > MAX_POPULAR_PAIRS {
            bail!("popular_pairs must list 1..={MAX_POPULAR_PAIRS} instruments");
        }
        for pair in &self.popular_pairs {
            Symbol::parse(pair).with_context(|| format!("popular_pairs entry {pair:?} is invalid"))?;
        }
        if matches!(&self.admin_token, Some(t) if t.trim().is_empty()) {
            bail!("admin_token must not be blank when set");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
        }
    }

    pub fn ttl_table(&self) -> TtlTable {
        TtlTable::from_secs(&self.candle_ttl_secs)
    }
}
