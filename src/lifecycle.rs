//! Resource lifecycle tracking and two-phase shutdown.
//!
//! Phase 1: the close flag is set, every live resource is asked to close,
//! and the tracker waits for the reference count to drain to zero. Phase 2
//! fires exactly once after that and tears down shared execution
//! resources. Registration after the close flag is set fails immediately
//! rather than racing the shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::{Error, Result};

struct TrackerInner {
    closing: AtomicBool,
    live: AtomicUsize,
    drained: Notify,
}

/// Reference-counted registry of live resources.
#[derive(Clone)]
pub(crate) struct ResourceTracker {
    inner: Arc<TrackerInner>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                closing: AtomicBool::new(false),
                live: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Register a resource, returning a guard that unregisters on drop.
    ///
    /// Fails with [`Error::Closed`] once shutdown has begun.
    pub fn register(&self) -> Result<ResourceGuard> {
        // Increment first, then re-check the flag: a concurrent close that
        // set the flag after our check will still see our count.
        self.inner.live.fetch_add(1, Ordering::AcqRel);
        if self.inner.closing.load(Ordering::Acquire) {
            self.unregister();
            return Err(Error::Closed);
        }
        Ok(ResourceGuard {
            tracker: self.clone(),
            released: false,
        })
    }

    fn unregister(&self) {
        if self.inner.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.drained.notify_waiters();
        }
    }

    /// Whether shutdown has begun.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Number of live resources.
    pub fn live_count(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Phase 1: set the close flag and wait for every resource to drain.
    ///
    /// Returns `true` for the caller that actually initiated the close;
    /// concurrent callers all wait for the drain but only one `true` is
    /// handed out, so phase 2 runs exactly once.
    pub async fn close_and_drain(&self) -> bool {
        let initiator = !self.inner.closing.swap(true, Ordering::AcqRel);
        loop {
            // Register interest before re-checking the count to avoid a
            // missed notification.
            let notified = self.inner.drained.notified();
            if self.inner.live.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        initiator
    }
}

/// Guard for one registered resource; unregisters on drop.
pub(crate) struct ResourceGuard {
    tracker: ResourceTracker,
    released: bool,
}

impl ResourceGuard {
    /// Release explicitly (same effect as drop).
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.tracker.unregister();
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_and_release() {
        let tracker = ResourceTracker::new();
        let guard = tracker.register().unwrap();
        assert_eq!(tracker.live_count(), 1);
        guard.release();
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_drop_releases() {
        let tracker = ResourceTracker::new();
        {
            let _guard = tracker.register().unwrap();
            assert_eq!(tracker.live_count(), 1);
        }
        assert_eq!(tracker.live_count(), 0);
    }

    #[tokio::test]
    async fn test_registration_fails_after_close() {
        let tracker = ResourceTracker::new();
        tracker.close_and_drain().await;
        assert!(matches!(tracker.register(), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_close_waits_for_drain() {
        let tracker = ResourceTracker::new();
        let guard = tracker.register().unwrap();

        let t = tracker.clone();
        let close = tokio::spawn(async move { t.close_and_drain().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!close.is_finished());
        assert!(tracker.is_closing());

        guard.release();
        assert!(close.await.unwrap());
    }

    #[tokio::test]
    async fn test_phase_two_fires_once() {
        let tracker = ResourceTracker::new();
        let mut initiators = 0;
        for _ in 0..4 {
            if tracker.close_and_drain().await {
                initiators += 1;
            }
        }
        assert_eq!(initiators, 1);
    }

    #[tokio::test]
    async fn test_concurrent_close_single_initiator() {
        let tracker = ResourceTracker::new();
        let guard = tracker.register().unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = tracker.clone();
            handles.push(tokio::spawn(async move { t.close_and_drain().await }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        guard.release();

        let mut initiators = 0;
        for h in handles {
            if h.await.unwrap() {
                initiators += 1;
            }
        }
        assert_eq!(initiators, 1);
    }
}
