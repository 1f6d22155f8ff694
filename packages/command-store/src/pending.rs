//! Pending-operation tracking and the meta ("work in flight") channel.
//!
//! Every scheduled async operation increments the counter before it is
//! spawned and decrements it exactly once when it is done, whether it
//! succeeded, failed, panicked or was aborted. The decrement is owned by a
//! [`PendingGuard`]: release it explicitly on the normal path, and `Drop`
//! covers every other path.
//!
//! Each transition of the counter notifies meta listeners with
//! `is_loading = count > 0`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::subscription::{SubscriberList, Subscription};

/// Counts operations in flight for one coordinator.
pub(crate) struct PendingTracker {
    count: AtomicUsize,
    notify: Notify,
    meta: SubscriberList<bool>,
}

impl PendingTracker {
    pub(crate) fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
            meta: SubscriberList::new("meta"),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.count() == 0
    }

    /// Increment and hand back the guard that owns the matching decrement.
    pub(crate) fn begin(self: &Arc<Self>, operation: &'static str) -> PendingGuard {
        let now = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(operation, pending = now, "operation pending");
        self.meta.notify(&true);
        PendingGuard {
            tracker: self.clone(),
            operation,
            released: false,
        }
    }

    fn end(&self, operation: &'static str) -> usize {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        let now = match prev {
            Ok(prev) => prev - 1,
            Err(_) => {
                warn!(operation, "pending counter decremented below zero, ignoring");
                0
            }
        };
        trace!(operation, pending = now, "operation finished");
        self.meta.notify(&(now > 0));
        if now == 0 {
            self.notify.notify_waiters();
        }
        now
    }

    /// Wait until the counter is zero.
    ///
    /// Notify is edge-triggered, so register before checking and loop.
    pub(crate) async fn wait_zero(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_settled() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn subscribe(
        &self,
        listener: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Subscription {
        self.meta.subscribe(listener)
    }

    pub(crate) fn clear_listeners(&self) {
        self.meta.clear();
    }

    #[cfg(any(test, feature = "testing"))]
    pub(crate) fn listener_count(&self) -> usize {
        self.meta.len()
    }
}

impl std::fmt::Debug for PendingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTracker")
            .field("count", &self.count())
            .finish()
    }
}

/// Owns one decrement of the pending counter.
///
/// `release` decrements and reports the remaining count. If the guard is
/// dropped unreleased (task aborted on dispose, panic while unwinding) the
/// decrement happens in `Drop`, so the counter can never get stuck.
pub(crate) struct PendingGuard {
    tracker: Arc<PendingTracker>,
    operation: &'static str,
    released: bool,
}

impl PendingGuard {
    /// Decrement now. Returns the number of operations still pending.
    pub(crate) fn release(mut self) -> usize {
        self.released = true;
        self.tracker.end(self.operation)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.released {
            self.tracker.end(self.operation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recording(tracker: &PendingTracker) -> Arc<Mutex<Vec<bool>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = tracker.subscribe(move |loading| sink.lock().unwrap().push(*loading));
        seen
    }

    #[test]
    fn test_begin_and_release() {
        let tracker = Arc::new(PendingTracker::new());
        let seen = recording(&tracker);

        let guard = tracker.begin("op");
        assert_eq!(tracker.count(), 1);
        assert!(!tracker.is_settled());

        assert_eq!(guard.release(), 0);
        assert!(tracker.is_settled());
        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn test_meta_reports_every_transition() {
        let tracker = Arc::new(PendingTracker::new());
        let seen = recording(&tracker);

        let a = tracker.begin("a");
        let b = tracker.begin("b");
        assert_eq!(a.release(), 1);
        assert_eq!(b.release(), 0);

        assert_eq!(*seen.lock().unwrap(), vec![true, true, true, false]);
    }

    #[test]
    fn test_drop_decrements_exactly_once() {
        let tracker = Arc::new(PendingTracker::new());
        {
            let _guard = tracker.begin("dropped");
            assert_eq!(tracker.count(), 1);
        }
        assert_eq!(tracker.count(), 0);

        let guard = tracker.begin("released");
        guard.release();
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_guard_panic_safety() {
        let tracker = Arc::new(PendingTracker::new());
        let t = tracker.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = t.begin("panicking");
            panic!("operation blew up");
        }));
        assert!(result.is_err());
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_zero_immediate() {
        let tracker = PendingTracker::new();
        tokio::time::timeout(Duration::from_millis(50), tracker.wait_zero())
            .await
            .expect("nothing pending");
    }

    #[tokio::test]
    async fn test_wait_zero_with_work() {
        let tracker = Arc::new(PendingTracker::new());
        let guard = tracker.begin("work");

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            guard.release();
        });

        tokio::time::timeout(Duration::from_secs(1), tracker.wait_zero())
            .await
            .expect("counter reaches zero");
        handle.await.unwrap();
    }

    #[test]
    fn test_clear_listeners() {
        let tracker = Arc::new(PendingTracker::new());
        let seen = recording(&tracker);
        assert_eq!(tracker.listener_count(), 1);

        tracker.clear_listeners();
        tracker.begin("quiet").release();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(tracker.listener_count(), 0);
    }
}
