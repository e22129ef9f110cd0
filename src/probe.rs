//! Capacity probe: turns raw platform samples into `SystemCapacity`
//! snapshots, with a short TTL cache to bound shell-invocation cost and a
//! fail-open policy so a broken monitor never blocks work.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::capacity::SystemCapacity;
use crate::platform::{default_provider, StatsProvider};

/// Default cache window. All callers within it observe the identical
/// snapshot; a small amount of staleness buys far fewer system calls.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(1);

pub struct CapacityProbe {
    provider: Arc<dyn StatsProvider>,
    cache_ttl: Duration,
    cache: Mutex<Option<(SystemCapacity, Instant)>>,
}

impl CapacityProbe {
    /// Probe with the platform provider chosen from OS identity.
    pub fn new() -> Self {
        Self::with_provider(Arc::from(default_provider()))
    }

    pub fn with_provider(provider: Arc<dyn StatsProvider>) -> Self {
        Self {
            provider,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache: Mutex::new(None),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Assess current capacity. Never fails: any provider error yields the
    /// fail-open capacity with a logged warning, so degraded monitoring
    /// behaves as permanently-nominal pressure rather than halting the host.
    pub async fn assess(&self) -> SystemCapacity {
        if let Some(cached) = self.cached() {
            return cached;
        }

        let provider = Arc::clone(&self.provider);
        let sampled = tokio::task::spawn_blocking(move || provider.sample()).await;

        let capacity = match sampled {
            Ok(Ok(stats)) => SystemCapacity::from_stats(&stats),
            Ok(Err(err)) => {
                warn!("capacity probe failed, assuming nominal pressure: {err:#}");
                SystemCapacity::fail_open()
            }
            Err(err) => {
                warn!("capacity probe task failed, assuming nominal pressure: {err}");
                SystemCapacity::fail_open()
            }
        };

        // Unlocked read-then-write is fine here: a race costs one redundant
        // probe, never a torn snapshot.
        *self.cache.lock().unwrap() = Some((capacity.clone(), Instant::now()));
        capacity
    }

    fn cached(&self) -> Option<SystemCapacity> {
        let cache = self.cache.lock().unwrap();
        match cache.as_ref() {
            Some((capacity, at)) if at.elapsed() < self.cache_ttl => Some(capacity.clone()),
            _ => None,
        }
    }

    /// Clear the cache slot so the next `assess` re-probes. Test hook.
    pub fn invalidate_cache(&self) {
        *self.cache.lock().unwrap() = None;
    }
}

impl Default for CapacityProbe {
    fn default() -> Self {
        Self::new()
    }
}
