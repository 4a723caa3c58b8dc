// =============================================================================
// Candle persistence — the key/value store behind the candle cache
// =============================================================================
//
// Entries are immutable once built and handed around as `Arc<CacheEntry>`, so
// replacing a key is a single pointer swap under a briefly held map lock and
// readers never observe a half-written series.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::candle::{CandleKey, CandleSeries};
use crate::types::{Interval, Symbol};

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// One cached series plus its staleness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub series: CandleSeries,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(series: CandleSeries, ttl: Duration) -> Self {
        Self {
            fetched_at: series.fetched_at,
            series,
            ttl_secs: ttl.as_secs(),
        }
    }

    /// `now - fetched_at < ttl`. A zero TTL is never fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.fetched_at);
        age < chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Key/value persistence for cache entries.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Lookup that only consults memory. Never blocks on I/O, so it is safe
    /// to call while holding a lock.
    fn cached(&self, key: &CandleKey) -> Option<Arc<CacheEntry>>;

    /// Memory first, then whatever backing storage the store has.
    async fn load(&self, key: &CandleKey) -> Option<Arc<CacheEntry>>;

    /// Replace whatever is stored under `key`. The in-memory copy is replaced
    /// even when persisting it fails.
    async fn store(&self, key: CandleKey, entry: Arc<CacheEntry>) -> Result<()>;

    /// Every key the store can serve, sorted.
    fn keys(&self) -> Vec<CandleKey>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryCandleStore {
    entries: RwLock<HashMap<CandleKey, Arc<CacheEntry>>>,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &CandleKey) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(key).cloned()
    }

    fn insert(&self, key: CandleKey, entry: Arc<CacheEntry>) {
        self.entries.write().insert(key, entry);
    }
}

#[async_trait]
impl CandleStore for InMemoryCandleStore {
    fn cached(&self, key: &CandleKey) -> Option<Arc<CacheEntry>> {
        self.get(key)
    }

    async fn load(&self, key: &CandleKey) -> Option<Arc<CacheEntry>> {
        self.get(key)
    }

    async fn store(&self, key: CandleKey, entry: Arc<CacheEntry>) -> Result<()> {
        self.insert(key, entry);
        Ok(())
    }

    fn keys(&self) -> Vec<CandleKey> {
        let mut keys: Vec<CandleKey> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

// ---------------------------------------------------------------------------
// File-backed
// ---------------------------------------------------------------------------

/// Write-through store: an in-memory map in front of one JSON file per key.
///
/// Files are written with the tmp + rename pattern so a crash mid-write leaves
/// the previous entry intact. The directory is indexed by file name once at
/// `open`; entries written by an earlier process are read lazily on first
/// `load`. All disk access after `open` runs on the blocking pool.
pub struct FileCandleStore {
    dir: PathBuf,
    memory: InMemoryCandleStore,
    on_disk: RwLock<BTreeSet<CandleKey>>,
}

impl FileCandleStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create candle store dir {}", dir.display()))?;

        let mut on_disk = BTreeSet::new();
        for file in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list candle store dir {}", dir.display()))?
            .flatten()
        {
            if let Some(key) = file.file_name().to_str().and_then(key_from_file_name) {
                on_disk.insert(key);
            }
        }

        info!(dir = %dir.display(), entries = on_disk.len(), "file candle store opened");
        Ok(Self {
            dir,
            memory: InMemoryCandleStore::new(),
            on_disk: RwLock::new(on_disk),
        })
    }

    fn path_for(&self, key: &CandleKey) -> PathBuf {
        self.dir.join(file_name_for(key))
    }

    fn read_file(path: &Path) -> Result<CacheEntry> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn write_file(path: &Path, content: &str) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename {}", tmp_path.display()))?;
        Ok(())
    }
}

/// `1m` and `1M` only differ by case, so the file name uses the variant
/// name rather than the OKX bar string.
fn file_name_for(key: &CandleKey) -> String {
    format!("{}__{:?}.json", key.symbol, key.interval)
}

fn key_from_file_name(name: &str) -> Option<CandleKey> {
    let (symbol, interval) = name.strip_suffix(".json")?.split_once("__")?;
    let interval = Interval::ALL
        .into_iter()
        .find(|iv| format!("{iv:?}") == interval)?;
    let symbol = Symbol::parse(symbol).ok()?;
    Some(CandleKey::new(symbol, interval))
}

#[async_trait]
impl CandleStore for FileCandleStore {
    fn cached(&self, key: &CandleKey) -> Option<Arc<CacheEntry>> {
        self.memory.get(key)
    }

    async fn load(&self, key: &CandleKey) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.memory.get(key) {
            return Some(entry);
        }
        if !self.on_disk.read().contains(key) {
            return None;
        }

        let path = self.path_for(key);
        let read = tokio::task::spawn_blocking(move || Self::read_file(&path)).await;
        match read {
            Ok(Ok(entry)) if entry.series.key() == *key => {
                debug!(key = %key, "candle entry restored from disk");
                // Another task may have stored a newer entry meanwhile.
                let mut map = self.memory.entries.write();
                let restored = map.entry(key.clone()).or_insert_with(|| Arc::new(entry));
                Some(restored.clone())
            }
            Ok(Ok(_)) => {
                warn!(key = %key, "candle file holds a different key, ignoring");
                None
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "failed to restore candle entry");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "candle restore task failed");
                None
            }
        }
    }

    async fn store(&self, key: CandleKey, entry: Arc<CacheEntry>) -> Result<()> {
        self.memory.insert(key.clone(), entry.clone());

        let path = self.path_for(&key);
        let written = tokio::task::spawn_blocking(move || {
            let content = serde_json::to_string(entry.as_ref())
                .context("failed to serialise candle entry to JSON")?;
            Self::write_file(&path, &content)
        })
        .await
        .context("candle persist task failed")?;
        written?;

        self.on_disk.write().insert(key);
        Ok(())
    }

    fn keys(&self) -> Vec<CandleKey> {
        let mut keys: BTreeSet<CandleKey> = self.on_disk.read().clone();
        keys.extend(self.memory.entries.read().keys().cloned());
        keys.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::candle::Candle;

    fn series(symbol: &str, interval: Interval, n: i64) -> CandleSeries {
        let candles = (0..n)
            .map(|i| Candle {
                open_time: i * interval.duration_ms(),
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
                close_time: (i + 1) * interval.duration_ms() - 1,
            })
            .collect();
        CandleSeries::from_unordered(Symbol::parse(symbol).unwrap(), interval, candles, Utc::now())
    }

    fn entry(series: CandleSeries, ttl_secs: u64) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(series, Duration::from_secs(ttl_secs)))
    }

    #[test]
    fn freshness_follows_ttl() {
        let entry = CacheEntry::new(series("BTC-USDT", Interval::Minute1, 3), Duration::from_secs(10));
        assert!(entry.is_fresh(entry.fetched_at + chrono::Duration::seconds(9)));
        assert!(!entry.is_fresh(entry.fetched_at + chrono::Duration::seconds(10)));

        let zero = CacheEntry::new(series("BTC-USDT", Interval::Minute1, 3), Duration::ZERO);
        assert!(!zero.is_fresh(zero.fetched_at));
    }

    #[tokio::test]
    async fn in_memory_store_replaces_whole_entry() {
        let store = InMemoryCandleStore::new();
        let first = series("BTC-USDT", Interval::Hour1, 5);
        let key = first.key();

        store.store(key.clone(), entry(first, 60)).await.unwrap();
        store
            .store(key.clone(), entry(series("BTC-USDT", Interval::Hour1, 2), 60))
            .await
            .unwrap();

        assert_eq!(store.load(&key).await.unwrap().series.len(), 2);
        assert_eq!(store.cached(&key).unwrap().series.len(), 2);
        assert_eq!(store.keys(), vec![key]);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let original = series("ETH-USDT", Interval::Minute1, 4);
        let key = original.key();

        {
            let store = FileCandleStore::open(dir.path()).unwrap();
            store.store(key.clone(), entry(original.clone(), 30)).await.unwrap();
        }

        let reopened = FileCandleStore::open(dir.path()).unwrap();
        // Indexed at open, but not read until someone asks for it.
        assert_eq!(reopened.keys(), vec![key.clone()]);
        assert!(reopened.cached(&key).is_none());

        let restored = reopened.load(&key).await.expect("entry should be restored");
        assert_eq!(restored.series, original);
        assert_eq!(restored.ttl_secs, 30);
        assert!(reopened.cached(&key).is_some());
    }

    #[tokio::test]
    async fn file_store_keeps_minute_and_month_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCandleStore::open(dir.path()).unwrap();

        let minute = series("BTC-USDT", Interval::Minute1, 2);
        let month = series("BTC-USDT", Interval::Month1, 3);
        store.store(minute.key(), entry(minute.clone(), 5)).await.unwrap();
        store.store(month.key(), entry(month.clone(), 5)).await.unwrap();

        let reopened = FileCandleStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load(&minute.key()).await.unwrap().series.len(), 2);
        assert_eq!(reopened.load(&month.key()).await.unwrap().series.len(), 3);
        assert_eq!(reopened.keys().len(), 2);
    }

    #[tokio::test]
    async fn missing_key_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCandleStore::open(dir.path()).unwrap();
        let key = CandleKey::new(Symbol::parse("SOL-USDT").unwrap(), Interval::Day1);
        assert!(store.load(&key).await.is_none());
    }

    #[tokio::test]
    async fn failed_write_still_replaces_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCandleStore::open(dir.path().join("candles")).unwrap();
        std::fs::remove_dir_all(dir.path().join("candles")).unwrap();

        let s = series("BTC-USDT", Interval::Hour4, 3);
        let key = s.key();
        assert!(store.store(key.clone(), entry(s, 60)).await.is_err());
        assert_eq!(store.cached(&key).unwrap().series.len(), 3);
        assert_eq!(store.keys(), vec![key]);
    }

    #[test]
    fn file_names_map_back_to_keys() {
        let key = CandleKey::new(Symbol::parse("BTC-USDT-SWAP").unwrap(), Interval::Month1);
        assert_eq!(key_from_file_name(&file_name_for(&key)), Some(key));
        assert_eq!(key_from_file_name("BTC-USDT__Minute1.json.tmp"), None);
        assert_eq!(key_from_file_name("notes.txt"), None);
        assert_eq!(key_from_file_name("BTC-USDT__Fortnight.json"), None);
    }
}
