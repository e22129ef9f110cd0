//! Scheduler registry: a process-wide directory of everything exposing the
//! poller lifecycle contract, so the host can start and stop them together.
//!
//! An explicit instance wired at startup, not a global singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::poller::{ManagedScheduler, SchedulerState};

/// Per-scheduler status as reported by `SchedulerRegistry::status`.
#[derive(Debug, Clone)]
pub enum SchedulerStatus {
    State(SchedulerState),
    Error(String),
}

impl SchedulerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SchedulerStatus::State(s) if s.is_running)
    }
}

#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: Mutex<HashMap<String, Arc<dyn ManagedScheduler>>>,
    started: AtomicBool,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scheduler. A duplicate name is a no-op with a warning (first
    /// registration wins). When the registry has already been started, the
    /// newcomer is started immediately so late registration never silently
    /// leaves work unscheduled.
    pub fn register(&self, scheduler: Arc<dyn ManagedScheduler>) {
        let name = scheduler.name().to_string();
        {
            let mut map = self.schedulers.lock().unwrap();
            if map.contains_key(&name) {
                warn!("registry: scheduler {name:?} already registered, ignoring");
                return;
            }
            map.insert(name.clone(), Arc::clone(&scheduler));
        }

        if self.started.load(Ordering::SeqCst) {
            debug!("registry: late registration of {name:?}, starting now");
            if let Err(err) = scheduler.start() {
                warn!("registry: failed to start late-registered {name:?}: {err:#}");
            }
        }
    }

    /// Stop (if running) and remove a scheduler. Unknown names are ignored.
    pub fn unregister(&self, name: &str) {
        let removed = self.schedulers.lock().unwrap().remove(name);
        if let Some(scheduler) = removed {
            if let Err(err) = scheduler.stop() {
                warn!("registry: failed to stop {name:?} during unregister: {err:#}");
            }
        }
    }

    /// Start every registered scheduler. A failure in one is logged and does
    /// not prevent the rest from being started.
    pub fn start_all(&self) {
        self.started.store(true, Ordering::SeqCst);
        for (name, scheduler) in self.snapshot() {
            if let Err(err) = scheduler.start() {
                warn!("registry: failed to start {name:?}: {err:#}");
            }
        }
    }

    /// Stop every registered scheduler, isolating per-scheduler failures.
    pub fn stop_all(&self) {
        self.started.store(false, Ordering::SeqCst);
        for (name, scheduler) in self.snapshot() {
            if let Err(err) = scheduler.stop() {
                warn!("registry: failed to stop {name:?}: {err:#}");
            }
        }
    }

    /// Per-name state map. A scheduler whose `state()` fails contributes its
    /// error text instead of poisoning the whole report.
    pub fn status(&self) -> HashMap<String, SchedulerStatus> {
        self.snapshot()
            .into_iter()
            .map(|(name, scheduler)| {
                let status = match scheduler.state() {
                    Ok(state) => SchedulerStatus::State(state),
                    Err(err) => SchedulerStatus::Error(format!("{err:#}")),
                };
                (name, status)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.schedulers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.lock().unwrap().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schedulers.lock().unwrap().contains_key(name)
    }

    /// Stop everything and clear the registry. Test hook.
    pub fn reset(&self) {
        self.stop_all();
        self.schedulers.lock().unwrap().clear();
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn ManagedScheduler>)> {
        self.schedulers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, s)| (name.clone(), Arc::clone(s)))
            .collect()
    }
}
