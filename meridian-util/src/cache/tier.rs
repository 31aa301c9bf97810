use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::CacheError;

/// A raw cache entry as returned by a tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierEntry {
    pub value: Vec<u8>,
    pub ttl_remaining: Duration,
}

/// A single storage level of a [`super::TieredCache`].
///
/// Tiers deal in encoded bytes only; they know nothing about the sentinel or
/// key namespacing. A distributed backend (e.g. redis) implements this trait
/// to act as the shared tier.
#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<TierEntry>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// An in-process tier with per-entry expiry and a bound on the number of
/// entries.
///
/// When full, the entry closest to expiry is evicted first.
#[derive(Debug)]
pub struct MemoryTier {
    max_entries: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // a panic while holding the lock cannot leave a map half-written
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    async fn get(&self, key: &str) -> Result<Option<TierEntry>, CacheError> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(TierEntry {
                value: entry.value.clone(),
                ttl_remaining: entry.expires_at - now,
            })),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, e| e.expires_at > now);

        if !entries.contains_key(key)
            && entries.len() >= self.max_entries
            && let Some(victim) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone())
        {
            entries.remove(&victim);
        }

        entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }
}
