//! Concurrency controller: a resizable bounded-parallelism limiter with a
//! watchdog that re-sizes it from live capacity probes.
//!
//! Resizing swaps in a freshly built semaphore rather than mutating the old
//! one. Tasks already admitted keep their permits from the old generation
//! and drain naturally; tasks not yet submitted acquire through the new one
//! and see the new cap immediately. The brief overshoot while the old cohort
//! drains is bounded and accepted.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::info;

use crate::capacity::PressureLevel;
use crate::poller::{ManagedScheduler, Poller, SchedulerState, TickFn};
use crate::probe::CapacityProbe;

/// Default watchdog tick interval.
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Multiplicative shrink factor applied under warning pressure.
const WARNING_SHRINK: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerState {
    pub current_concurrency: usize,
    pub active_workers: usize,
    pub pending_tasks: usize,
    pub is_watchdog_running: bool,
}

pub struct ConcurrencyController {
    name: String,
    min: usize,
    max: usize,
    current: AtomicUsize,
    active: AtomicUsize,
    pending: AtomicUsize,
    semaphore: RwLock<Arc<Semaphore>>,
    probe: Arc<CapacityProbe>,
    watchdog: Mutex<Option<Poller>>,
    last_logged: Mutex<Option<(usize, usize, usize)>>,
    weak_self: Weak<Self>,
}

impl ConcurrencyController {
    /// Build a controller with its own platform probe. The initial value is
    /// clamped into `[min, max]`.
    pub fn new(initial: usize, min: usize, max: usize) -> Arc<Self> {
        Self::with_probe(initial, min, max, Arc::new(CapacityProbe::new()))
    }

    pub fn with_probe(
        initial: usize,
        min: usize,
        max: usize,
        probe: Arc<CapacityProbe>,
    ) -> Arc<Self> {
        let max = max.max(min);
        let initial = initial.clamp(min, max);
        Arc::new_cyclic(|weak_self| Self {
            name: "concurrency-watchdog".to_string(),
            min,
            max,
            current: AtomicUsize::new(initial),
            active: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            semaphore: RwLock::new(Arc::new(Semaphore::new(initial))),
            probe,
            watchdog: Mutex::new(None),
            last_logged: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn current_concurrency(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ControllerState {
        ControllerState {
            current_concurrency: self.current_concurrency(),
            active_workers: self.active_workers(),
            pending_tasks: self.pending_tasks(),
            is_watchdog_running: self
                .watchdog
                .lock()
                .unwrap()
                .as_ref()
                .map(|p| p.is_running())
                .unwrap_or(false),
        }
    }

    /// Execute `task` once a concurrency slot is available. The task's output
    /// is returned unchanged; errors propagate verbatim, never retried or
    /// swallowed here.
    pub async fn run<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        // Acquire through the current generation. Tasks that started waiting
        // on an older generation keep their place there.
        let semaphore = Arc::clone(&*self.semaphore.read().unwrap());
        // Never closed; held for the duration of the task.
        let permit = semaphore.acquire_owned().await.unwrap();
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);

        let result = task().await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
        result
    }

    /// One watchdog pass: probe capacity, compute the target, swap the
    /// limiter generation when it differs.
    ///
    /// Scale policy is asymmetric to avoid oscillation: critical drops to
    /// `min` at once, warning shrinks multiplicatively, nominal grows by a
    /// single step.
    pub async fn adjust_once(&self) {
        let capacity = self.probe.assess().await;
        let current = self.current.load(Ordering::SeqCst);

        let target = match capacity.pressure_level {
            PressureLevel::Critical => self.min,
            PressureLevel::Warning => {
                (((current as f64) * WARNING_SHRINK).floor() as usize).max(self.min)
            }
            PressureLevel::Nominal => (current + 1).min(self.max),
        };

        if target != current {
            *self.semaphore.write().unwrap() = Arc::new(Semaphore::new(target));
            self.current.store(target, Ordering::SeqCst);
        }

        let active = self.active_workers();
        let pending = self.pending_tasks();

        // Idle periods between runs stay quiet; log only when work exists
        // and something actually changed since the last log.
        if active > 0 || pending > 0 {
            let snapshot = (target, active, pending);
            let mut last = self.last_logged.lock().unwrap();
            if *last != Some(snapshot) {
                info!(
                    "{}: concurrency {current} -> {target} (pressure={} active={active} pending={pending})",
                    self.name, capacity.pressure_level
                );
                *last = Some(snapshot);
            }
        }
    }

    /// Start the watchdog poller. No-op with a warning if already running.
    pub fn start_watchdog(&self, interval: Duration) {
        let mut watchdog = self.watchdog.lock().unwrap();
        if let Some(poller) = watchdog.as_ref() {
            if poller.is_running() {
                Poller::start(poller);
                return;
            }
        }

        let weak = self.weak_self.clone();
        let tick: TickFn = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(controller) = weak.upgrade() {
                    controller.adjust_once().await;
                }
            })
        });

        let poller = Poller::new(self.name.clone(), interval, tick);
        poller.start();
        *watchdog = Some(poller);
    }

    pub fn stop_watchdog(&self) {
        if let Some(poller) = self.watchdog.lock().unwrap().take() {
            poller.stop();
        }
    }

    pub fn is_watchdog_running(&self) -> bool {
        self.watchdog
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.is_running())
            .unwrap_or(false)
    }
}

impl ManagedScheduler for ConcurrencyController {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<()> {
        self.start_watchdog(DEFAULT_WATCHDOG_INTERVAL);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stop_watchdog();
        Ok(())
    }

    fn state(&self) -> Result<SchedulerState> {
        let watchdog = self.watchdog.lock().unwrap();
        Ok(match watchdog.as_ref() {
            Some(poller) => Poller::state(poller),
            None => SchedulerState {
                is_running: false,
                ticks: 0,
                interval_ms: DEFAULT_WATCHDOG_INTERVAL.as_millis() as u64,
            },
        })
    }
}
