//! Generic polling scheduler: run an async callback every N milliseconds
//! until stopped. Every poller in the governor (pressure monitor, controller
//! watchdogs) is built on this, and all of them expose the same lifecycle
//! contract so a host process can manage them uniformly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Snapshot of a scheduler's lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerState {
    pub is_running: bool,
    /// Completed ticks since construction (manual ticks included).
    pub ticks: u64,
    pub interval_ms: u64,
}

/// Uniform lifecycle contract for everything the registry manages.
pub trait ManagedScheduler: Send + Sync {
    /// Stable identifier, unique within a registry.
    fn name(&self) -> &str;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn state(&self) -> Result<SchedulerState>;
}

/// Tick callback. Must produce an owned future so the poll loop can run it
/// from a spawned task.
pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Poller {
    name: String,
    interval: Duration,
    tick: TickFn,
    ticks: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<(tokio::task::JoinHandle<()>, Arc<Notify>)>>,
}

impl Poller {
    pub fn new(name: impl Into<String>, interval: Duration, tick: TickFn) -> Self {
        Self {
            name: name.into(),
            interval,
            tick,
            ticks: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Trigger a single tick inline, without the timer. Test hook; also
    /// counted in `tick_count`.
    pub async fn tick_now(&self) {
        (self.tick)().await;
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    /// Begin periodic ticking. The first tick fires immediately. No-op with
    /// a warning if already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("poller {}: already running, start ignored", self.name);
            return;
        }

        let tick = Arc::clone(&self.tick);
        let ticks = Arc::clone(&self.ticks);
        let running = Arc::clone(&self.running);
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = Arc::clone(&shutdown);
        let interval = self.interval;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        tick().await;
                        ticks.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = shutdown_rx.notified() => break,
                }
            }
            running.store(false, Ordering::SeqCst);
            debug!("poller {name}: stopped");
        });

        *self.handle.lock().unwrap() = Some((handle, shutdown));
    }

    /// Halt future ticks. An in-flight tick runs to completion; the loop
    /// exits at the next iteration. No-op if not running.
    pub fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            debug!("poller {}: not running, stop ignored", self.name);
            return;
        }
        // Detach rather than abort so an in-flight tick is not interrupted;
        // the loop observes the notification at its next iteration.
        if let Some((_handle, shutdown)) = self.handle.lock().unwrap().take() {
            shutdown.notify_one();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            is_running: self.is_running(),
            ticks: self.tick_count(),
            interval_ms: self.interval.as_millis() as u64,
        }
    }
}

impl ManagedScheduler for Poller {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<()> {
        Poller::start(self);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Poller::stop(self);
        Ok(())
    }

    fn state(&self) -> Result<SchedulerState> {
        Ok(Poller::state(self))
    }
}
