//! Adaptive streaming stage: a bounded fan-out transform over a stream that
//! subscribes to the pressure monitor instead of polling on its own.
//!
//! The fan-out width is fixed when the stream is built; pressure changes
//! update (and log) the target for the next instantiation rather than
//! resizing the live stream. The subscription is owned by the stream and
//! dropped with it, so early termination never leaks a subscriber.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{Stream, StreamExt};
use tracing::info;

use crate::capacity::recommended_concurrency;
use crate::monitor::{PressureMonitor, Subscription};

#[derive(Debug, Clone)]
pub struct AdaptiveStageConfig {
    pub initial_concurrency: usize,
    pub min: usize,
    pub max: usize,
}

impl Default for AdaptiveStageConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: 4,
            min: 1,
            max: 16,
        }
    }
}

/// Stream of transformed items in completion order, holding its monitor
/// subscription for the duration.
pub struct AdaptiveStream<T> {
    inner: Pin<Box<dyn Stream<Item = T> + Send>>,
    target: Arc<AtomicUsize>,
    _subscription: Subscription,
}

impl<T> AdaptiveStream<T> {
    /// The concurrency the stage currently wants, kept up to date by the
    /// pressure subscription. Applies to the next instantiation, not the
    /// live fan-out.
    pub fn target_concurrency(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }
}

impl<T> Stream for AdaptiveStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

/// Transform `source` through `f` with bounded, pressure-aware parallelism.
/// Results arrive in completion order, not source order.
pub fn adaptive_transform<S, F, Fut, U>(
    monitor: &PressureMonitor,
    config: AdaptiveStageConfig,
    source: S,
    transform: F,
) -> AdaptiveStream<U>
where
    S: Stream + Send + 'static,
    S::Item: Send,
    F: FnMut(S::Item) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = U> + Send + 'static,
    U: Send + 'static,
{
    let min = config.min;
    let max = config.max.max(min);
    let static_limit = config.initial_concurrency.clamp(min, max);

    let target = Arc::new(AtomicUsize::new(static_limit));
    let subscription = monitor.subscribe({
        let target = Arc::clone(&target);
        move |level, _capacity| {
            let next = recommended_concurrency(level, static_limit, min, max);
            let prev = target.swap(next, Ordering::SeqCst);
            if prev != next {
                info!("adaptive stage: target concurrency {prev} -> {next} (pressure={level})");
            }
        }
    });

    // subscribe() delivered the current snapshot (if any) synchronously, so
    // a stream built under live pressure starts at the adjusted width.
    let concurrency = target.load(Ordering::SeqCst).max(1);
    let inner = source.map(transform).buffer_unordered(concurrency).boxed();

    AdaptiveStream {
        inner,
        target,
        _subscription: subscription,
    }
}
