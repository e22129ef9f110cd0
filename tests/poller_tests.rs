//! Tests for the generic polling scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loadguard::poller::{ManagedScheduler, Poller, TickFn};

mod common;

fn counting_poller(interval: Duration) -> (Poller, Arc<AtomicUsize>) {
    common::init_tracing();
    let count = Arc::new(AtomicUsize::new(0));
    let tick_count = Arc::clone(&count);
    let tick: TickFn = Arc::new(move || {
        let count = Arc::clone(&tick_count);
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
        })
    });
    (Poller::new("test-poller", interval, tick), count)
}

#[tokio::test]
async fn test_manual_tick() {
    let (poller, count) = counting_poller(Duration::from_secs(3600));

    assert!(!poller.is_running());
    poller.tick_now().await;
    poller.tick_now().await;

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(poller.tick_count(), 2);
    assert!(!poller.is_running());
}

#[tokio::test]
async fn test_periodic_ticking() {
    let (poller, count) = counting_poller(Duration::from_millis(10));

    Poller::start(&poller);
    assert!(poller.is_running());

    tokio::time::sleep(Duration::from_millis(80)).await;
    Poller::stop(&poller);
    assert!(!poller.is_running());

    // First tick fires immediately, then every 10ms.
    assert!(count.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_stop_halts_future_ticks() {
    let (poller, count) = counting_poller(Duration::from_millis(10));

    Poller::start(&poller);
    tokio::time::sleep(Duration::from_millis(40)).await;
    Poller::stop(&poller);

    // Let any in-flight tick drain, then confirm the count is frozen.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let frozen = count.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), frozen);
}

#[tokio::test]
async fn test_double_start_is_noop() {
    let (poller, _count) = counting_poller(Duration::from_millis(10));

    Poller::start(&poller);
    Poller::start(&poller);
    assert!(poller.is_running());
    Poller::stop(&poller);
}

#[tokio::test]
async fn test_stop_when_not_running_is_noop() {
    let (poller, _count) = counting_poller(Duration::from_millis(10));

    Poller::stop(&poller);
    assert!(!poller.is_running());
}

#[tokio::test]
async fn test_restart_after_stop() {
    let (poller, count) = counting_poller(Duration::from_millis(10));

    Poller::start(&poller);
    tokio::time::sleep(Duration::from_millis(30)).await;
    Poller::stop(&poller);
    let after_first_run = count.load(Ordering::SeqCst);

    Poller::start(&poller);
    assert!(poller.is_running());
    tokio::time::sleep(Duration::from_millis(30)).await;
    Poller::stop(&poller);

    assert!(count.load(Ordering::SeqCst) > after_first_run);
}

#[tokio::test]
async fn test_state_reporting() {
    let (poller, _count) = counting_poller(Duration::from_millis(250));

    let state = Poller::state(&poller);
    assert!(!state.is_running);
    assert_eq!(state.ticks, 0);
    assert_eq!(state.interval_ms, 250);

    poller.tick_now().await;
    Poller::start(&poller);
    let state = Poller::state(&poller);
    assert!(state.is_running);
    assert!(state.ticks >= 1);
    Poller::stop(&poller);
}

#[tokio::test]
async fn test_managed_scheduler_contract() {
    let (poller, _count) = counting_poller(Duration::from_millis(10));
    let scheduler: &dyn ManagedScheduler = &poller;

    assert_eq!(scheduler.name(), "test-poller");
    scheduler.start().unwrap();
    assert!(scheduler.state().unwrap().is_running);
    scheduler.stop().unwrap();
    assert!(!scheduler.state().unwrap().is_running);
}
