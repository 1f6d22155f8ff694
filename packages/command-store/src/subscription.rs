//! Listener lists shared by the snapshot and meta channels.
//!
//! Listeners are plain synchronous callbacks. Notification clones the
//! current list and calls each listener outside the lock, so a listener may
//! unsubscribe itself (or others) while being notified. A panicking listener
//! is logged and skipped; the remaining listeners still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{error, warn};

use crate::error::panic_message;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Listener<T>)>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("listener list mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

/// An ordered list of listeners for values of type `T`.
pub(crate) struct SubscriberList<T> {
    inner: Arc<Inner<T>>,
    channel: &'static str,
}

impl<T: 'static> SubscriberList<T> {
    pub(crate) fn new(channel: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                listeners: Mutex::new(Vec::new()),
            }),
            channel,
        }
    }

    pub(crate) fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription
    where
        T: Send,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().push((id, Arc::new(listener)));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            remove: Box::new(move |id| {
                weak.upgrade()
                    .map(|inner| inner.remove(id))
                    .unwrap_or(false)
            }),
        }
    }

    /// Notify every current listener. Returns how many returned normally.
    pub(crate) fn notify(&self, value: &T) -> usize {
        let listeners: Vec<(u64, Listener<T>)> = self.inner.lock().clone();
        let mut delivered = 0;

        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(value))) {
                Ok(()) => delivered += 1,
                Err(panic_info) => {
                    let panic_msg = panic_message(panic_info.as_ref());
                    error!(
                        channel = self.channel,
                        listener = id,
                        panic = %panic_msg,
                        "listener panicked"
                    );
                }
            }
        }

        delivered
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl<T> std::fmt::Debug for SubscriberList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberList")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle does **not** unsubscribe; call
/// [`Subscription::unsubscribe`] to stop receiving values.
pub struct Subscription {
    id: u64,
    remove: Box<dyn Fn(u64) -> bool + Send + Sync>,
}

impl Subscription {
    /// Remove the listener. Returns false if it was already gone (for
    /// example after the coordinator was disposed).
    pub fn unsubscribe(self) -> bool {
        (self.remove)(self.id)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_notify_reaches_all_listeners_in_order() {
        let list = SubscriberList::<u32>::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            let _ = list.subscribe(move |v: &u32| seen.lock().unwrap().push(format!("{tag}{v}")));
        }

        assert_eq!(list.notify(&1), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1"]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let list = SubscriberList::<u32>::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        let sub = {
            let count = count.clone();
            list.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        list.notify(&1);
        assert!(sub.unsubscribe());
        list.notify(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let list = SubscriberList::<u32>::new("test");
        let count = Arc::new(AtomicUsize::new(0));

        let _ = list.subscribe(|_| panic!("broken observer"));
        let _ = {
            let count = count.clone();
            list.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert_eq!(list.notify(&1), 1);
        assert_eq!(list.notify(&2), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_can_unsubscribe_itself() {
        let list = Arc::new(SubscriberList::<u32>::new("test"));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let sub = {
            let slot = slot.clone();
            let count = count.clone();
            list.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            })
        };
        *slot.lock().unwrap() = Some(sub);

        list.notify(&1);
        list.notify(&2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_then_unsubscribe_reports_missing() {
        let list = SubscriberList::<u32>::new("test");
        let sub = list.subscribe(|_| {});
        list.clear();
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn test_unsubscribe_after_list_dropped() {
        let list = SubscriberList::<u32>::new("test");
        let sub = list.subscribe(|_| {});
        drop(list);
        assert!(!sub.unsubscribe());
    }
}
