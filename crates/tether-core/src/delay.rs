//! Cancellable timer primitives.
//!
//! Every timer in the engine (the persistence debounce, finalization grace
//! eviction, the kill escalation) goes through these two types so the
//! cancellation discipline stays in one place.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A single delayed action. The action runs once after `delay` unless
/// cancelled first. Cancellation after the action fired is a no-op.
#[derive(Debug)]
pub struct DelayedAction {
    cancel: CancellationToken,
}

impl DelayedAction {
    pub fn spawn<F>(delay: Duration, action: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let watch = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = watch.cancelled() => {}
                _ = tokio::time::sleep(delay) => action.await,
            }
        });
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Debounced action slot: at most one action armed at a time. Scheduling
/// while armed is a no-op; the armed action runs with the state current at
/// fire time, so collapsing schedules loses nothing.
pub struct Debounce {
    delay: Duration,
    armed: Arc<AtomicBool>,
    slot: parking_lot::Mutex<Option<DelayedAction>>,
}

impl Debounce {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            armed: Arc::new(AtomicBool::new(false)),
            slot: parking_lot::Mutex::new(None),
        }
    }

    pub fn schedule<F>(&self, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let armed = self.armed.clone();
        let handle = DelayedAction::spawn(self.delay, async move {
            armed.store(false, Ordering::SeqCst);
            action.await;
        });
        *self.slot.lock() = Some(handle);
    }

    /// Disarm any pending action.
    pub fn cancel(&self) {
        if let Some(handle) = self.slot.lock().take() {
            handle.cancel();
        }
        self.armed.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn delayed_action_fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _action = DelayedAction::spawn(Duration::from_millis(20), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_action_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let action = DelayedAction::spawn(Duration::from_millis(20), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        action.cancel();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn debounce_collapses_repeat_schedules() {
        let hits = Arc::new(AtomicUsize::new(0));
        let debounce = Debounce::new(Duration::from_millis(30));
        for _ in 0..5 {
            let counter = hits.clone();
            debounce.schedule(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn debounce_rearms_after_fire_and_after_cancel() {
        let hits = Arc::new(AtomicUsize::new(0));
        let debounce = Debounce::new(Duration::from_millis(20));

        let counter = hits.clone();
        debounce.schedule(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(80)).await;

        let counter = hits.clone();
        debounce.schedule(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let counter = hits.clone();
        debounce.schedule(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        debounce.cancel();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
