//! Hot cache layer using [`moka`].
//!
//! Wraps common database queries with a lock-free, concurrent LRU cache.
//! Supports caching any `Serialize + DeserializeOwned` type via a generic
//! [`CacheLayer`] struct.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Total cache hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total cache misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Total lookups (hits + misses).
    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate as a value between 0.0 and 1.0 (returns 0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} total={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.total(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── cache layer ──────────────────────────────────────────────────────

/// A generic, async-aware cache backed by `moka::future::Cache`.
///
/// `T` must be `Serialize + DeserializeOwned + Clone + Send + Sync`.
/// Values are stored as JSON strings internally so any serializable
/// type can share the same cache infrastructure.
///
/// # Example
///
/// ```ignore
/// use pydra_store::cache::CacheLayer;
///
/// let cache: CacheLayer<MyRecord> = CacheLayer::builder("my_records")
///     .max_capacity(1000)
///     .ttl_seconds(300)
///     .build();
///
/// // Try the cache first, fall back to DB.
/// let record = match cache.get("record:123").await {
///     Some(r) => r,
///     None => {
///         let r = fetch_from_db(123).await?;
///         cache.insert("record:123", &r).await?;
///         r
///     }
/// };
/// ```
pub struct CacheLayer<T> {
    name: &'static str,
    inner: Cache<String, String>,
    stats: Arc<CacheStats>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Clone for CacheLayer<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> CacheLayer<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start building a new cache layer.
    pub fn builder(name: &'static str) -> CacheLayerBuilder<T> {
        CacheLayerBuilder {
            name,
            max_capacity: 10_000,
            ttl_seconds: 300,
            _marker: std::marker::PhantomData,
        }
    }

    /// Look up a cached value by key. Returns `None` on miss.
    pub async fn get(&self, key: &str) -> Option<T> {
        match self.inner.get(key).await {
            Some(json_str) => match serde_json::from_str::<T>(&json_str) {
                Ok(val) => {
                    self.stats.record_hit();
                    debug!(cache = self.name, key = key, "cache hit");
                    Some(val)
                }
                Err(err) => {
                    // Corrupted entry — evict and treat as miss.
                    tracing::warn!(
                        cache = self.name,
                        key = key,
                        %err,
                        "cache entry deserialization failed, evicting"
                    );
                    self.inner.invalidate(key).await;
                    self.stats.record_miss();
                    None
                }
            },
            None => {
                self.stats.record_miss();
                debug!(cache = self.name, key = key, "cache miss");
                None
            }
        }
    }

    /// Insert a value into the cache.
    pub async fn insert(&self, key: &str, value: &T) -> StoreResult<()> {
        let json_str =
            serde_json::to_string(value).map_err(|e| StoreError::Cache(e.to_string()))?;
        self.inner.insert(key.to_string(), json_str).await;
        debug!(cache = self.name, key = key, "cache insert");
        Ok(())
    }

    /// Remove a specific entry from the cache.
    pub async fn invalidate(&self, key: &str) {
        self.inner.invalidate(key).await;
        debug!(cache = self.name, key = key, "cache invalidate");
    }

    /// Remove all entries from the cache.
    pub async fn invalidate_all(&self) {
        self.inner.invalidate_all();
        debug!(cache = self.name, "cache invalidate_all");
    }

    /// Get a reference to the cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Return the current number of entries in the cache.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Get or insert: try the cache, and if missing, call the async loader,
    /// cache the result, and return it.
    ///
    /// This is the preferred way to use the cache — single call that handles
    /// the hit/miss/insert flow automatically.
    pub async fn get_or_insert_with<F, Fut>(
        &self,
        key: &str,
        loader: F,
    ) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(cached);
        }

        let value = loader().await?;
        self.insert(key, &value).await?;
        Ok(value)
    }
}

// ── builder ──────────────────────────────────────────────────────────

/// Builder for [`CacheLayer`].
pub struct CacheLayerBuilder<T> {
    name: &'static str,
    max_capacity: u64,
    ttl_seconds: u64,
    _marker: std::marker::PhantomData<T>,
}

impl<T> CacheLayerBuilder<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Maximum number of entries the cache will hold.
    pub fn max_capacity(mut self, cap: u64) -> Self {
        self.max_capacity = cap;
        self
    }

    /// Time-to-live in seconds for each entry.
    pub fn ttl_seconds(mut self, secs: u64) -> Self {
        self.ttl_seconds = secs;
        self
    }

    /// Build the cache layer.
    pub fn build(self) -> CacheLayer<T> {
        let inner = Cache::builder()
            .max_capacity(self.max_capacity)
            .time_to_live(Duration::from_secs(self.ttl_seconds))
            .build();

        debug!(
            name = self.name,
            max_capacity = self.max_capacity,
            ttl_seconds = self.ttl_seconds,
            "cache layer created"
        );

        CacheLayer {
            name: self.name,
            inner,
            stats: Arc::new(CacheStats::new()),
            _marker: std::marker::PhantomData,
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
