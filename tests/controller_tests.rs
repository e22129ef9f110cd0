//! Tests for the concurrency controller: clamping, the asymmetric scale
//! policy, bounded in-flight execution, and error propagation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use loadguard::capacity::RawStats;
use loadguard::controller::ConcurrencyController;
use loadguard::platform::StatsProvider;
use loadguard::probe::CapacityProbe;

mod common;

const GIB: u64 = 1024 * 1024 * 1024;

fn stats_with_available(available_gib: f64) -> RawStats {
    RawStats {
        total_memory: 16 * GIB,
        available_memory: (available_gib * GIB as f64) as u64,
        swap_used: 0,
        swap_total: 0,
        swap_active: false,
        free_percent: None,
        load_avg_1m: 1.0,
        cpu_count: 8,
    }
}

fn nominal() -> RawStats {
    stats_with_available(8.0)
}

fn warning() -> RawStats {
    stats_with_available(1.6)
}

fn critical() -> RawStats {
    stats_with_available(0.5)
}

struct SwitchableProvider {
    stats: Mutex<RawStats>,
}

impl SwitchableProvider {
    fn new(stats: RawStats) -> Arc<Self> {
        Arc::new(Self {
            stats: Mutex::new(stats),
        })
    }

    fn set(&self, stats: RawStats) {
        *self.stats.lock().unwrap() = stats;
    }
}

impl StatsProvider for SwitchableProvider {
    fn sample(&self) -> Result<RawStats> {
        Ok(self.stats.lock().unwrap().clone())
    }
}

fn probe_for(provider: Arc<dyn StatsProvider>) -> Arc<CapacityProbe> {
    common::init_tracing();
    Arc::new(CapacityProbe::with_provider(provider).with_cache_ttl(Duration::ZERO))
}

// ============================================================================
// Construction clamping
// ============================================================================

#[tokio::test]
async fn test_initial_clamped_up_to_min() {
    let ctrl = ConcurrencyController::new(0, 1, 10);
    assert_eq!(ctrl.current_concurrency(), 1);
}

#[tokio::test]
async fn test_initial_clamped_down_to_max() {
    let ctrl = ConcurrencyController::new(20, 1, 10);
    assert_eq!(ctrl.current_concurrency(), 10);
}

#[tokio::test]
async fn test_initial_within_bounds_unchanged() {
    let ctrl = ConcurrencyController::new(4, 1, 10);
    assert_eq!(ctrl.current_concurrency(), 4);
    let state = ctrl.state();
    assert_eq!(state.current_concurrency, 4);
    assert_eq!(state.active_workers, 0);
    assert_eq!(state.pending_tasks, 0);
    assert!(!state.is_watchdog_running);
}

// ============================================================================
// Scale policy
// ============================================================================

#[tokio::test]
async fn test_critical_drops_to_min_in_one_tick() {
    let ctrl = ConcurrencyController::with_probe(8, 2, 10, probe_for(SwitchableProvider::new(critical())));

    ctrl.adjust_once().await;
    assert_eq!(ctrl.current_concurrency(), 2);
}

#[tokio::test]
async fn test_nominal_grows_by_one_until_max() {
    let ctrl = ConcurrencyController::with_probe(3, 1, 5, probe_for(SwitchableProvider::new(nominal())));

    ctrl.adjust_once().await;
    assert_eq!(ctrl.current_concurrency(), 4);
    ctrl.adjust_once().await;
    assert_eq!(ctrl.current_concurrency(), 5);
    ctrl.adjust_once().await;
    assert_eq!(ctrl.current_concurrency(), 5);
}

#[tokio::test]
async fn test_warning_shrinks_multiplicatively() {
    let ctrl = ConcurrencyController::with_probe(10, 1, 10, probe_for(SwitchableProvider::new(warning())));

    ctrl.adjust_once().await;
    // floor(10 * 0.7) = 7
    assert_eq!(ctrl.current_concurrency(), 7);
    ctrl.adjust_once().await;
    // floor(7 * 0.7) = 4
    assert_eq!(ctrl.current_concurrency(), 4);
}

#[tokio::test]
async fn test_warning_shrink_respects_min() {
    let ctrl = ConcurrencyController::with_probe(2, 1, 10, probe_for(SwitchableProvider::new(warning())));

    ctrl.adjust_once().await;
    // floor(2 * 0.7) = 1
    assert_eq!(ctrl.current_concurrency(), 1);
    ctrl.adjust_once().await;
    assert_eq!(ctrl.current_concurrency(), 1);
}

#[tokio::test]
async fn test_recovery_cycle_stays_in_bounds() {
    let provider = SwitchableProvider::new(nominal());
    let ctrl = ConcurrencyController::with_probe(6, 2, 8, probe_for(provider.clone()));

    provider.set(critical());
    ctrl.adjust_once().await;
    assert_eq!(ctrl.current_concurrency(), 2);

    provider.set(nominal());
    for _ in 0..10 {
        ctrl.adjust_once().await;
        let current = ctrl.current_concurrency();
        assert!((2..=8).contains(&current));
    }
    assert_eq!(ctrl.current_concurrency(), 8);
}

// ============================================================================
// Task execution
// ============================================================================

#[tokio::test]
async fn test_run_returns_task_result() {
    let ctrl = ConcurrencyController::new(2, 1, 4);
    let value = ctrl.run(|| async { 41 + 1 }).await;
    assert_eq!(value, 42);
}

#[tokio::test]
async fn test_task_error_propagates_unchanged() {
    let ctrl = ConcurrencyController::new(2, 1, 4);
    let before = ctrl.current_concurrency();

    let result: Result<()> = ctrl.run(|| async { Err(anyhow!("task exploded")) }).await;
    let err = result.unwrap_err();
    assert_eq!(err.to_string(), "task exploded");

    // A failing task does not alter concurrency or leak counters.
    assert_eq!(ctrl.current_concurrency(), before);
    assert_eq!(ctrl.active_workers(), 0);
    assert_eq!(ctrl.pending_tasks(), 0);
}

#[tokio::test]
async fn test_in_flight_never_exceeds_cap() {
    let ctrl = ConcurrencyController::new(2, 1, 8);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..12 {
        let ctrl = Arc::clone(&ctrl);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            ctrl.run(|| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(ctrl.active_workers(), 0);
    assert_eq!(ctrl.pending_tasks(), 0);
}

#[tokio::test]
async fn test_generation_swap_does_not_disturb_running_tasks() {
    let provider = SwitchableProvider::new(critical());
    let ctrl = ConcurrencyController::with_probe(4, 1, 8, probe_for(provider));

    let completed = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let ctrl = Arc::clone(&ctrl);
        let completed = Arc::clone(&completed);
        handles.push(tokio::spawn(async move {
            ctrl.run(|| async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }));
    }

    // Give the tasks time to be admitted, then shrink the limiter hard.
    tokio::time::sleep(Duration::from_millis(10)).await;
    ctrl.adjust_once().await;
    assert_eq!(ctrl.current_concurrency(), 1);

    // The old cohort drains normally; nothing is dropped or duplicated.
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 4);

    // New admissions go through the shrunk generation.
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let ctrl = Arc::clone(&ctrl);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            ctrl.run(|| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pending_tasks_counted_while_queued() {
    let ctrl = ConcurrencyController::new(1, 1, 1);

    let release = Arc::new(tokio::sync::Notify::new());
    let holder = {
        let ctrl = Arc::clone(&ctrl);
        let release = Arc::clone(&release);
        tokio::spawn(async move {
            ctrl.run(|| async move {
                release.notified().await;
            })
            .await;
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ctrl.active_workers(), 1);

    let queued = {
        let ctrl = Arc::clone(&ctrl);
        tokio::spawn(async move {
            ctrl.run(|| async {}).await;
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ctrl.pending_tasks(), 1);

    release.notify_one();
    holder.await.unwrap();
    queued.await.unwrap();
    assert_eq!(ctrl.active_workers(), 0);
    assert_eq!(ctrl.pending_tasks(), 0);
}

// ============================================================================
// Watchdog lifecycle
// ============================================================================

#[tokio::test]
async fn test_watchdog_start_stop() {
    let ctrl = ConcurrencyController::with_probe(4, 1, 8, probe_for(SwitchableProvider::new(nominal())));

    assert!(!ctrl.is_watchdog_running());
    ctrl.start_watchdog(Duration::from_millis(10));
    assert!(ctrl.is_watchdog_running());
    assert!(ctrl.state().is_watchdog_running);

    // Growth happens on watchdog ticks without manual adjustment.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(ctrl.current_concurrency() > 4);

    ctrl.stop_watchdog();
    assert!(!ctrl.is_watchdog_running());
}

#[tokio::test]
async fn test_watchdog_reacts_to_pressure() {
    let provider = SwitchableProvider::new(critical());
    let ctrl = ConcurrencyController::with_probe(8, 2, 10, probe_for(provider));

    ctrl.start_watchdog(Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctrl.stop_watchdog();

    assert_eq!(ctrl.current_concurrency(), 2);
}
