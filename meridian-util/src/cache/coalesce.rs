use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes computations per key so concurrent misses compute once.
#[derive(Debug, Default)]
pub(super) struct Coalescer {
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Coalescer {
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(
                inflight
                    .entry(key.to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Drop the key lock if nobody else is waiting on it.
    ///
    /// Must be called while still holding the guard returned by `acquire`.
    pub async fn release(&self, key: &str) {
        let mut inflight = self.inflight.lock().await;
        // one reference from the map, one from the caller's guard
        if inflight
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2)
        {
            inflight.remove(key);
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inflight.lock().await.len()
    }
}
