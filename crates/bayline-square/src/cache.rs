use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{CatalogClient, SquareError};

pub const CATALOG_CACHE_CAPACITY: usize = 512;
pub const CATALOG_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// Bounded map whose entries expire `ttl` after insertion.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now()).await
    }

    pub async fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some(entry) if now.saturating_duration_since(entry.stored_at) < self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    pub async fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now()).await;
    }

    pub async fn insert_at(&self, key: K, value: V, now: Instant) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, entry| now.saturating_duration_since(entry.stored_at) < ttl);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.stored_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Catalog lookups memoized in a caller-supplied cache. Failures are never cached.
pub struct CachedCatalog<C> {
    inner: C,
    cache: Arc<TtlCache<String, String>>,
}

impl<C: CatalogClient> CachedCatalog<C> {
    pub fn new(inner: C, cache: Arc<TtlCache<String, String>>) -> Self {
        Self { inner, cache }
    }

    pub fn with_default_cache(inner: C) -> Self {
        Self::new(
            inner,
            Arc::new(TtlCache::new(CATALOG_CACHE_CAPACITY, CATALOG_CACHE_TTL)),
        )
    }

    pub fn cache(&self) -> &Arc<TtlCache<String, String>> {
        &self.cache
    }
}

#[async_trait]
impl<C: CatalogClient> CatalogClient for CachedCatalog<C> {
    async fn service_name(&self, variation_id: &str) -> Result<String, SquareError> {
        let key = variation_id.to_string();
        if let Some(name) = self.cache.get(&key).await {
            return Ok(name);
        }
        let name = self.inner.service_name(variation_id).await?;
        debug!(variation_id, service_name = %name, "catalog name cached");
        self.cache.insert(key, name.clone()).await;
        Ok(name)
    }
}
