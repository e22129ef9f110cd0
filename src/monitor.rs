//! Pressure monitor: a poller that keeps the last-known capacity snapshot
//! and broadcasts it to subscribers on every tick.
//!
//! Subscriber callbacks run inline on the tick and must not block; anything
//! needing async work should hand it off and return promptly.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::capacity::{PressureLevel, SystemCapacity};
use crate::poller::{ManagedScheduler, Poller, SchedulerState, TickFn};
use crate::probe::CapacityProbe;

/// Default poll interval: long enough that probe overhead is noise, short
/// enough to react to sustained pressure within a reasonable window.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

type SubscriberFn = Arc<dyn Fn(PressureLevel, &SystemCapacity) + Send + Sync>;

struct MonitorInner {
    probe: Arc<CapacityProbe>,
    current: RwLock<Option<SystemCapacity>>,
    subscribers: Mutex<HashMap<u64, SubscriberFn>>,
    next_id: AtomicU64,
}

impl MonitorInner {
    async fn tick(&self) {
        let capacity = self.probe.assess().await;
        let level = capacity.pressure_level;

        let previous = {
            let mut current = self.current.write().unwrap();
            let previous = current.as_ref().map(|c| c.pressure_level);
            *current = Some(capacity.clone());
            previous
        };

        // State changes are signal; unchanged steady state is noise.
        match previous {
            Some(prev) if prev == level => {
                debug!(
                    "pressure steady at {level} (cpu={:.1}% mem={:.1}%)",
                    capacity.cpu_utilization, capacity.memory_utilization
                );
            }
            Some(prev) => {
                info!(
                    "pressure level changed {prev} -> {level} (cpu={:.1}% mem={:.1}%)",
                    capacity.cpu_utilization, capacity.memory_utilization
                );
            }
            None => {
                info!(
                    "pressure level {level} (cpu={:.1}% mem={:.1}%)",
                    capacity.cpu_utilization, capacity.memory_utilization
                );
            }
        }

        self.notify_all(level, &capacity);
    }

    /// Every subscriber sees the same pair; a panicking subscriber is logged
    /// and does not affect the rest or the tick.
    fn notify_all(&self, level: PressureLevel, capacity: &SystemCapacity) {
        let subscribers: Vec<(u64, SubscriberFn)> = {
            let map = self.subscribers.lock().unwrap();
            map.iter().map(|(id, cb)| (*id, Arc::clone(cb))).collect()
        };
        for (id, callback) in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(level, capacity))).is_err() {
                warn!("pressure subscriber {id} panicked, continuing");
            }
        }
    }
}

/// Handle returned by `PressureMonitor::subscribe`. Dropping it removes the
/// subscription.
pub struct Subscription {
    id: u64,
    inner: Weak<MonitorInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().unwrap().remove(&self.id);
        }
    }
}

pub struct PressureMonitor {
    inner: Arc<MonitorInner>,
    poller: Poller,
}

impl PressureMonitor {
    pub fn new(probe: Arc<CapacityProbe>) -> Self {
        Self::with_interval(probe, DEFAULT_MONITOR_INTERVAL)
    }

    pub fn with_interval(probe: Arc<CapacityProbe>, interval: Duration) -> Self {
        let inner = Arc::new(MonitorInner {
            probe,
            current: RwLock::new(None),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        });

        let tick_inner = Arc::clone(&inner);
        let tick: TickFn = Arc::new(move || {
            let inner = Arc::clone(&tick_inner);
            Box::pin(async move { inner.tick().await })
        });

        Self {
            inner,
            poller: Poller::new("pressure-monitor", interval, tick),
        }
    }

    /// Register a callback invoked with `(level, capacity)` on every tick.
    /// When a snapshot already exists, the subscriber is notified immediately
    /// and synchronously, so a late joiner never misses the current state.
    /// Each call is an independent subscription, even for the same closure.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(PressureLevel, &SystemCapacity) + Send + Sync + 'static,
    {
        let callback: SubscriberFn = Arc::new(callback);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&callback));

        let current = self.inner.current.read().unwrap().clone();
        if let Some(capacity) = current {
            let level = capacity.pressure_level;
            if catch_unwind(AssertUnwindSafe(|| callback(level, &capacity))).is_err() {
                warn!("pressure subscriber {id} panicked during initial notify");
            }
        }

        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn current_pressure(&self) -> Option<PressureLevel> {
        self.inner
            .current
            .read()
            .unwrap()
            .as_ref()
            .map(|c| c.pressure_level)
    }

    pub fn current_capacity(&self) -> Option<SystemCapacity> {
        self.inner.current.read().unwrap().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().unwrap().len()
    }

    /// Probe and broadcast once, without the timer. Test hook.
    pub async fn tick_now(&self) {
        self.poller.tick_now().await;
    }

    pub fn start(&self) {
        self.poller.start();
    }

    pub fn stop(&self) {
        self.poller.stop();
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }
}

impl ManagedScheduler for PressureMonitor {
    fn name(&self) -> &str {
        "pressure-monitor"
    }

    fn start(&self) -> Result<()> {
        self.poller.start();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.poller.stop();
        Ok(())
    }

    fn state(&self) -> Result<SchedulerState> {
        Ok(self.poller.state())
    }
}
