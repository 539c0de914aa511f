//! Idle tracking for the service.
//!
//! Every request holds an [`ActivityGuard`] while its handler runs. The
//! watcher shuts the service down once nothing is in flight and the last
//! request finished longer ago than the idle timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use axum::{extract::Request, extract::State, middleware::Next, response::Response};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
struct Inner {
    in_flight: AtomicUsize,
    last_activity: Mutex<Instant>,
}

/// Shared activity clock for all connections.
#[derive(Debug, Clone)]
pub struct IdleTracker {
    inner: Arc<Inner>,
}

impl Default for IdleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                in_flight: AtomicUsize::new(0),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn begin(&self) -> ActivityGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            tracker: self.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn last_activity(&self) -> Instant {
        match self.inner.last_activity.lock() {
            Ok(at) => *at,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn touch(&self) {
        let mut at = match self.inner.last_activity.lock() {
            Ok(at) => at,
            Err(poisoned) => poisoned.into_inner(),
        };
        *at = Instant::now();
    }

    /// Time left before the service counts as idle, or `None` if it already is.
    fn remaining(&self, timeout: Duration) -> Option<Duration> {
        if self.in_flight() > 0 {
            return Some(timeout);
        }
        let deadline = self.last_activity() + timeout;
        deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

/// Marks one request as in flight until dropped.
#[derive(Debug)]
pub struct ActivityGuard {
    tracker: IdleTracker,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.tracker.touch();
        self.tracker.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Middleware recording request activity.
pub async fn track_activity(
    State(tracker): State<IdleTracker>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = tracker.begin();
    next.run(request).await
}

/// Cancel `shutdown` once the service has been idle for `timeout`.
pub async fn watch(tracker: IdleTracker, timeout: Duration, shutdown: CancellationToken) {
    loop {
        let Some(wait) = tracker.remaining(timeout) else {
            info!("no activity for {:?}, shutting down", timeout);
            shutdown.cancel();
            return;
        };
        debug!("idle check in {:?}", wait);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_watch_fires_after_timeout() {
        let tracker = IdleTracker::new();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(watch(tracker.clone(), Duration::from_secs(5), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!shutdown.is_cancelled());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(shutdown.is_cancelled());
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_clock() {
        let tracker = IdleTracker::new();
        let shutdown = CancellationToken::new();
        tokio::spawn(watch(tracker.clone(), Duration::from_secs(5), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        drop(tracker.begin());
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!shutdown.is_cancelled());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_request_keeps_service_alive() {
        let tracker = IdleTracker::new();
        let shutdown = CancellationToken::new();
        tokio::spawn(watch(tracker.clone(), Duration::from_secs(1), shutdown.clone()));

        let guard = tracker.begin();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!shutdown.is_cancelled());
        assert_eq!(tracker.in_flight(), 1);

        drop(guard);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(shutdown.is_cancelled());
    }
}
