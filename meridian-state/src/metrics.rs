use std::sync::Arc;

use futures::FutureExt;
use tracing::{trace, warn};

use meridian_util::cache::{Cache, ComputeError};
use meridian_util::types::Uuid;

/// Limits how often a device may write its hardware metrics.
///
/// A device may write metrics when the cache has no entry for it. The entry
/// is created by that same call and expires after the cache TTL, which is
/// the minimum interval between two metrics writes.
#[derive(Clone)]
pub struct MetricsThrottle {
    cache: Arc<dyn Cache<str, Uuid>>,
}

impl MetricsThrottle {
    pub fn new(cache: Arc<dyn Cache<str, Uuid>>) -> Self {
        Self { cache }
    }

    /// Return true if `device` may write its metrics now
    pub async fn allow(&self, device: &Uuid) -> bool {
        // only this call's computation can return this token
        let token = Uuid::default();
        let compute = {
            let token = token.clone();
            async move { Ok::<_, ComputeError>(Some(token)) }.boxed()
        };

        match self.cache.get_or_compute(device.as_str(), compute).await {
            Ok(Some(stored)) => {
                let allowed = stored == token;
                trace!(device = %device, allowed, "metrics throttle");
                allowed
            }
            Ok(None) => true,
            Err(err) => {
                warn!(device = %device, "metrics throttle unavailable: {err}");
                true
            }
        }
    }

    /// Give back the window taken by [`Self::allow`] for metrics that were
    /// never written
    pub async fn release(&self, device: &Uuid) {
        if let Err(err) = self.cache.invalidate(device.as_str()).await {
            warn!(device = %device, "failed to release metrics throttle: {err}");
        }
    }
}
