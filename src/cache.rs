use crate::error::{ProviderError, Result};
use crate::metrics;
use crate::provider::DataProvider;
use async_trait::async_trait;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default bound on a single cache lookup before reading through.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Key/value cache tier with per-entry TTL.
///
/// `get` returns `Ok(None)` on a miss or an expired entry. Errors mean the tier
/// itself is unavailable.
#[async_trait]
pub trait CacheProvider<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn name(&self) -> &str;

    async fn get(&self, key: &K) -> Result<Option<V>>;

    async fn set(&self, key: K, value: V, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) < self.ttl
    }
}

#[derive(Debug, Clone)]
/// Process-local cache tier backed by a `DashMap`.
///
/// ## Features
///
/// - **Lazy expiry**: TTL is checked on read, there is no background sweep
/// - **Opportunistic eviction**: expired entries are dropped on write once the
///   map grows past `max_entries`
/// - **Thread-Safe**: shared through `Arc`, lock-free reads per shard
pub struct InMemoryCache<K, V>
where
    K: Eq + Hash,
{
    name: String,
    entries: Arc<DashMap<K, CacheEntry<V>>>,
    max_entries: usize,
}

impl<K, V> InMemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, 10_000)
    }

    pub fn with_capacity(name: impl Into<String>, max_entries: usize) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(DashMap::new()),
            max_entries,
        }
    }

    /// Number of stored entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_evict(&self, keep: &K) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));

        // Still over capacity: drop arbitrary entries until back under the cap.
        let overflow = self.entries.len().saturating_sub(self.max_entries);
        if overflow > 0 {
            let victims: Vec<K> = self
                .entries
                .iter()
                .filter(|e| e.key() != keep)
                .take(overflow)
                .map(|e| e.key().clone())
                .collect();
            for key in &victims {
                self.entries.remove(key);
            }
        }
        debug!(cache = %self.name, size = self.entries.len(), "evicted cache entries");
        metrics::set_cache_size(&self.name, self.entries.len() as f64);
    }
}

#[async_trait]
impl<K, V> CacheProvider<K, V> for InMemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> Result<Option<V>> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone());
        Ok(value)
    }

    async fn set(&self, key: K, value: V, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
        self.maybe_evict(&key);
        Ok(())
    }
}

/// Read-through cache in front of any [`DataProvider`].
///
/// Only successful inner results are stored. An unavailable cache tier is
/// logged and bypassed, the inner provider still answers.
pub struct CachingProvider<P>
where
    P: DataProvider,
{
    name: String,
    inner: P,
    cache: Arc<dyn CacheProvider<P::Key, P::Value>>,
    ttl: Duration,
    lookup_timeout: Duration,
}

impl<P> CachingProvider<P>
where
    P: DataProvider,
{
    pub fn new(inner: P, cache: Arc<dyn CacheProvider<P::Key, P::Value>>, ttl: Duration) -> Self {
        let name = format!("caching({})", inner.name());
        Self {
            name,
            inner,
            cache,
            ttl,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// Wraps `inner` with a fresh [`InMemoryCache`].
    pub fn in_memory(inner: P, cache_name: &str, ttl: Duration) -> Self {
        let cache: Arc<dyn CacheProvider<P::Key, P::Value>> =
            Arc::new(InMemoryCache::new(cache_name));
        Self::new(inner, cache, ttl)
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn lookup(&self, key: &P::Key) -> Option<P::Value> {
        let cache_name = self.cache.name();
        let outcome = match tokio::time::timeout(self.lookup_timeout, self.cache.get(key)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProviderError::timeout(cache_name, self.lookup_timeout)),
        };
        match outcome {
            Ok(Some(value)) => {
                metrics::increment_cache_hit(cache_name);
                Some(value)
            }
            Ok(None) => {
                metrics::increment_cache_miss(cache_name);
                None
            }
            Err(e) => {
                warn!(cache = %cache_name, key = ?key, error = %e, "cache tier unavailable, reading through");
                metrics::increment_cache_tier_error(cache_name);
                None
            }
        }
    }
}

#[async_trait]
impl<P> DataProvider for CachingProvider<P>
where
    P: DataProvider,
{
    type Key = P::Key;
    type Value = P::Value;

    fn name(&self) -> &str {
        &self.name
    }

    fn chain_id(&self) -> Option<crate::chain::ChainId> {
        self.inner.chain_id()
    }

    async fn fetch(&self, key: &Self::Key) -> Result<Self::Value> {
        if let Some(value) = self.lookup(key).await {
            return Ok(value);
        }

        let value = self.inner.fetch(key).await?;

        if let Err(e) = self.cache.set(key.clone(), value.clone(), self.ttl).await {
            warn!(cache = %self.cache.name(), key = ?key, error = %e, "failed to populate cache");
            metrics::increment_cache_tier_error(self.cache.name());
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_lazily() {
        let cache: InMemoryCache<u32, &'static str> = InMemoryCache::new("test");
        cache.set(1, "one", Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get(&1).await.unwrap(), Some("one"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get(&1).await.unwrap(), None);
        // Nothing swept it yet.
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_evicts_expired_entries_over_capacity() {
        let cache: InMemoryCache<u32, u32> = InMemoryCache::with_capacity("small", 2);
        cache.set(1, 1, Duration::from_secs(1)).await.unwrap();
        cache.set(2, 2, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.set(3, 3, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&3).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_capacity_is_enforced_without_expiry() {
        let cache: InMemoryCache<u32, u32> = InMemoryCache::with_capacity("tiny", 3);
        for i in 0..10 {
            cache.set(i, i, Duration::from_secs(600)).await.unwrap();
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&9).await.unwrap(), Some(9));
    }
}
