//! A read-through, two-tier cache.
//!
//! [`TieredCache`] looks a key up in a fast in-process tier first and in a
//! shared tier second. On a miss it runs the caller's computation once, even
//! when many callers miss the same key at the same time, and stores the
//! result in both tiers with the same TTL.
//!
//! A computation may legitimately produce no value. Since a shared backend
//! cannot tell an empty entry from a missing one, "no value" is stored as
//! the [`Cached::Missing`] sentinel so it is not recomputed on every call.
//!
//! Keys are namespaced by a cache name and a deployment version, so entries
//! written by a previous release are never read back after an upgrade.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

mod coalesce;
mod tier;

use coalesce::Coalescer;
pub use tier::{CacheTier, MemoryTier, TierEntry};

pub type ComputeError = Box<dyn std::error::Error + Send + Sync>;

/// The computation run on a cache miss
pub type Compute<'a, V> = BoxFuture<'a, Result<Option<V>, ComputeError>>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to encode cache entry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode cache entry: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("cache backend failure: {0}")]
    Backend(String),

    #[error("failed to compute value: {0}")]
    Compute(#[source] ComputeError),
}

/// Read-through cache contract
#[async_trait]
pub trait Cache<K: ?Sized + Sync, V: Send>: Send + Sync {
    /// Return the cached value for `key`, running `compute` on a miss.
    ///
    /// A cached "no value" is returned as `Ok(None)` without running
    /// `compute`.
    async fn get_or_compute<'a>(
        &'a self,
        key: &'a K,
        compute: Compute<'a, V>,
    ) -> Result<Option<V>, CacheError>;

    /// Remove `key` from every tier
    async fn invalidate(&self, key: &K) -> Result<(), CacheError>;
}

/// Encoded form of a cache entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Cached<V> {
    Missing,
    Value(V),
}

impl<V> From<Option<V>> for Cached<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(v) => Cached::Value(v),
            None => Cached::Missing,
        }
    }
}

impl<V> From<Cached<V>> for Option<V> {
    fn from(value: Cached<V>) -> Self {
        match value {
            Cached::Value(v) => Some(v),
            Cached::Missing => None,
        }
    }
}

pub struct TieredCache<V> {
    namespace: String,
    ttl: Duration,
    refresh_threshold: Option<Duration>,
    local: MemoryTier,
    shared: Arc<dyn CacheTier>,
    inflight: Coalescer,
    _value: PhantomData<fn() -> V>,
}

impl<V> fmt::Debug for TieredCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCache")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .field("refresh_threshold", &self.refresh_threshold)
            .finish()
    }
}

impl<V> TieredCache<V> {
    /// Create a cache called `name` for the deployment `version`.
    pub fn new(name: &str, version: &str, ttl: Duration, shared: Arc<dyn CacheTier>) -> Self {
        Self {
            namespace: format!("{name}:{version}:"),
            ttl,
            refresh_threshold: None,
            local: MemoryTier::default(),
            shared,
            inflight: Coalescer::default(),
            _value: PhantomData,
        }
    }

    /// Treat entries with less than `threshold` left to live as misses, so
    /// hot keys are recomputed before they expire.
    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = Some(threshold);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    fn is_fresh(&self, entry: &TierEntry) -> bool {
        self.refresh_threshold
            .is_none_or(|threshold| entry.ttl_remaining > threshold)
    }
}

impl<V> TieredCache<V>
where
    V: DeserializeOwned,
{
    async fn lookup(&self, key: &str) -> Result<Option<Cached<V>>, CacheError> {
        if let Some(entry) = self.local.get(key).await?
            && self.is_fresh(&entry)
        {
            trace!(cache.key = %key, cache.tier = "local", "hit");
            return decode(&entry.value).map(Some);
        }

        if let Some(entry) = self.shared.get(key).await?
            && self.is_fresh(&entry)
        {
            trace!(cache.key = %key, cache.tier = "shared", "hit");
            let value = decode(&entry.value)?;
            // expire together with the shared copy
            self.local
                .set(key, entry.value, entry.ttl_remaining)
                .await?;
            return Ok(Some(value));
        }

        Ok(None)
    }
}

impl<V> TieredCache<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    async fn compute_and_store(
        &self,
        key: &str,
        compute: Compute<'_, V>,
    ) -> Result<Option<V>, CacheError> {
        // somebody else may have computed the value while we waited
        if let Some(cached) = self.lookup(key).await? {
            return Ok(cached.into());
        }

        trace!(cache.key = %key, "miss");
        let value = compute.await.map_err(CacheError::Compute)?;

        let bytes = serde_json::to_vec(&Cached::from(value.clone())).map_err(CacheError::Encode)?;
        if let Err(err) = self.shared.set(key, bytes.clone(), self.ttl).await {
            // the local tier still spares this process the recomputation
            warn!(cache.key = %key, "failed to write shared cache tier: {err}");
        }
        self.local.set(key, bytes, self.ttl).await?;

        Ok(value)
    }
}

fn decode<V: DeserializeOwned>(bytes: &[u8]) -> Result<Cached<V>, CacheError> {
    serde_json::from_slice(bytes).map_err(CacheError::Decode)
}

#[async_trait]
impl<V> Cache<str, V> for TieredCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn get_or_compute<'a>(
        &'a self,
        key: &'a str,
        compute: Compute<'a, V>,
    ) -> Result<Option<V>, CacheError> {
        let key = self.namespaced(key);
        if let Some(cached) = self.lookup(&key).await? {
            return Ok(cached.into());
        }

        let _guard = self.inflight.acquire(&key).await;
        let result = self.compute_and_store(&key, compute).await;
        self.inflight.release(&key).await;
        result
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let key = self.namespaced(key);
        self.local.delete(&key).await?;
        self.shared.delete(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache<V>(shared: Arc<MemoryTier>, version: &str) -> TieredCache<V> {
        TieredCache::new("test", version, Duration::from_secs(60), shared)
    }

    fn counting(calls: &Arc<AtomicUsize>, value: Option<u32>) -> Compute<'static, u32> {
        let calls = Arc::clone(calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
        .boxed()
    }

    #[tokio::test]
    async fn it_computes_on_miss_and_reuses_the_result() {
        let cache = cache::<u32>(Arc::new(MemoryTier::default()), "1");
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_compute("key", counting(&calls, Some(7)))
            .await
            .unwrap();
        let second = cache
            .get_or_compute("key", counting(&calls, Some(8)))
            .await
            .unwrap();

        assert_eq!(first, Some(7));
        assert_eq!(second, Some(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn it_caches_missing_values_with_the_sentinel() {
        let shared = Arc::new(MemoryTier::default());
        let cache = cache::<u32>(Arc::clone(&shared), "1");
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(
            cache
                .get_or_compute("nothing", counting(&calls, None))
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            cache
                .get_or_compute("nothing", counting(&calls, Some(1)))
                .await
                .unwrap(),
            None
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let raw = shared.get("test:1:nothing").await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&raw.value).unwrap(),
            serde_json::json!({"kind": "missing"})
        );
    }

    #[tokio::test]
    async fn concurrent_misses_compute_once() {
        let cache = Arc::new(cache::<u32>(Arc::new(MemoryTier::default()), "1"));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|_| {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_compute(
                        "shared",
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(Some(42))
                        }
                        .boxed(),
                    )
                    .await
                    .unwrap()
            })
        });

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap(), Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.inflight.len().await, 0);
    }

    #[tokio::test]
    async fn it_reads_through_to_the_shared_tier() {
        let shared = Arc::new(MemoryTier::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let writer = cache::<u32>(Arc::clone(&shared), "1");
        writer
            .get_or_compute("key", counting(&calls, Some(3)))
            .await
            .unwrap();

        // a second process only shares the distributed tier
        let reader = cache::<u32>(Arc::clone(&shared), "1");
        assert_eq!(
            reader
                .get_or_compute("key", counting(&calls, Some(4)))
                .await
                .unwrap(),
            Some(3)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(reader.local.len(), 1);
    }

    #[tokio::test]
    async fn a_new_version_does_not_see_old_entries() {
        let shared = Arc::new(MemoryTier::default());
        let calls = Arc::new(AtomicUsize::new(0));

        cache::<u32>(Arc::clone(&shared), "1")
            .get_or_compute("key", counting(&calls, Some(1)))
            .await
            .unwrap();
        let value = cache::<u32>(Arc::clone(&shared), "2")
            .get_or_compute("key", counting(&calls, Some(2)))
            .await
            .unwrap();

        assert_eq!(value, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_recompute() {
        let cache = cache::<u32>(Arc::new(MemoryTier::default()), "1");
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_compute("key", counting(&calls, Some(1)))
            .await
            .unwrap();
        cache.invalidate("key").await.unwrap();
        let value = cache
            .get_or_compute("key", counting(&calls, Some(2)))
            .await
            .unwrap();

        assert_eq!(value, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn entries_inside_the_refresh_threshold_are_recomputed() {
        let cache = TieredCache::<u32>::new(
            "test",
            "1",
            Duration::from_secs(10),
            Arc::new(MemoryTier::default()),
        )
        .with_refresh_threshold(Duration::from_secs(20));
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_compute("key", counting(&calls, Some(1)))
            .await
            .unwrap();
        cache
            .get_or_compute("key", counting(&calls, Some(2)))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn compute_errors_are_not_cached() {
        let cache = cache::<u32>(Arc::new(MemoryTier::default()), "1");
        let calls = Arc::new(AtomicUsize::new(0));

        let err = cache
            .get_or_compute(
                "key",
                async { Err::<Option<u32>, ComputeError>("boom".into()) }.boxed(),
            )
            .await;
        assert!(matches!(err, Err(CacheError::Compute(_))));

        let value = cache
            .get_or_compute("key", counting(&calls, Some(5)))
            .await
            .unwrap();
        assert_eq!(value, Some(5));
    }
}
