use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

// One TtlCache instance per value type, keyed by a namespaced string like
// "epel:9:x86_64" or "ocp:releases:stable-4.17". Entries past the ttl are
// invisible to readers and get replaced whole on the next fetch, never
// merged.

#[derive(Clone)]
pub struct TtlCache<V> {
    inner: Cache<String, V>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) {
        self.inner.insert(key.into(), value).await;
    }

    /// Return the cached value for `key`, or run `init` and cache its
    /// result. Concurrent misses on the same key collapse into a single
    /// upstream fetch.
    pub async fn get_or_fetch<F, E>(&self, key: &str, init: F) -> Result<V, Arc<E>>
    where
        F: Future<Output = Result<V, E>>,
        E: Send + Sync + 'static,
    {
        self.inner
            .entry(key.to_string())
            .or_try_insert_with(init)
            .await
            .map(|entry| entry.into_value())
    }
}
