//! Callback subscriptions with scope-managed detach, and the outstanding
//! operation counter streams use to drain before teardown.
//!
//! Every `on_*` API stores its callback in a [`CallbackRegistry`] and hands
//! back a [`Handle`]. Dropping the handle removes the callback under the
//! registry lock. Dispatch snapshots the callback list under a read lock and
//! invokes outside it, so callbacks are free to call back into the library.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;

/// Type-erased removal hook so `Handle` does not carry the event type.
trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

/// Subscription token. Move-only; dropping it detaches the callback. A
/// dispatch already in flight from a snapshot may complete at most once
/// after the drop.
#[derive(Debug)]
pub struct Handle {
    registry: Option<Weak<dyn Detach>>,
    id: u64,
}

impl Handle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Consume the handle without detaching: the callback stays registered
    /// for the registry's lifetime.
    pub fn disable(mut self) {
        self.registry = None;
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(weak) = self.registry.take() {
            if let Some(registry) = weak.upgrade() {
                registry.detach(self.id);
            }
        }
    }
}

type Callback<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

struct RegistryInner<E> {
    callbacks: RwLock<BTreeMap<u64, Callback<E>>>,
    next_id: AtomicU64,
}

impl<E: 'static> Detach for RegistryInner<E> {
    fn detach(&self, id: u64) {
        self.callbacks.write().remove(&id);
    }
}

/// Ordered callback registry with snapshot-on-dispatch fan-out.
pub struct CallbackRegistry<E> {
    inner: Arc<RegistryInner<E>>,
}

impl<E> Default for CallbackRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> CallbackRegistry<E> {
    #[must_use]
    pub fn new() -> Self {
        CallbackRegistry {
            inner: Arc::new(RegistryInner {
                callbacks: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.callbacks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.callbacks.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.callbacks.write().clear();
    }
}

impl<E: 'static> CallbackRegistry<E> {
    /// Register a callback. Returning `false` from the callback removes it.
    pub fn add<F>(&self, callback: F) -> Handle
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.write().insert(id, Arc::new(callback));
        // Downgrade before unsizing so inference picks the concrete type.
        let weak = Arc::downgrade(&self.inner);
        let weak: Weak<dyn Detach> = weak;
        Handle {
            registry: Some(weak),
            id,
        }
    }

    fn snapshot(&self) -> Vec<(u64, Callback<E>)> {
        self.inner
            .callbacks
            .read()
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect()
    }

    /// Invoke every callback with `event`. Callbacks that return `false`
    /// unsubscribe themselves; callbacks that panic are removed. Returns the
    /// number of panicking callbacks so the caller can surface a dispatch
    /// failure event.
    pub fn dispatch(&self, event: &E) -> usize {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return 0;
        }

        let mut remove = Vec::new();
        let mut panicked = 0usize;
        for (id, cb) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| cb(event))) {
                Ok(true) => {}
                Ok(false) => remove.push(id),
                Err(_) => {
                    tracing::error!("callback {id} panicked during dispatch, removing it");
                    remove.push(id);
                    panicked += 1;
                }
            }
        }

        if !remove.is_empty() {
            let mut guard = self.inner.callbacks.write();
            for id in remove {
                guard.remove(&id);
            }
        }
        panicked
    }

}

type FilterCallback<E> = Arc<dyn Fn(&mut E) -> bool + Send + Sync>;

struct FilterInner<E> {
    callbacks: RwLock<BTreeMap<u64, FilterCallback<E>>>,
    next_id: AtomicU64,
}

impl<E: 'static> Detach for FilterInner<E> {
    fn detach(&self, id: u64) {
        self.callbacks.write().remove(&id);
    }
}

/// Registry variant for intercept callbacks: each callback may mutate the
/// event in place or veto it by returning `false`. Vetoing does not
/// unsubscribe.
pub struct FilterRegistry<E> {
    inner: Arc<FilterInner<E>>,
}

impl<E> Default for FilterRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> FilterRegistry<E> {
    #[must_use]
    pub fn new() -> Self {
        FilterRegistry {
            inner: Arc::new(FilterInner {
                callbacks: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.callbacks.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.callbacks.read().is_empty()
    }
}

impl<E: 'static> FilterRegistry<E> {
    pub fn add<F>(&self, callback: F) -> Handle
    where
        F: Fn(&mut E) -> bool + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.write().insert(id, Arc::new(callback));
        let weak = Arc::downgrade(&self.inner);
        let weak: Weak<dyn Detach> = weak;
        Handle {
            registry: Some(weak),
            id,
        }
    }

    /// Run every callback over `event` in registration order. Returns
    /// `false` if any callback vetoed; panicking callbacks are removed.
    pub fn dispatch_mut(&self, event: &mut E) -> bool {
        let snapshot: Vec<(u64, FilterCallback<E>)> = self
            .inner
            .callbacks
            .read()
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        let mut allowed = true;
        let mut remove = Vec::new();
        for (id, cb) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| cb(event))) {
                Ok(true) => {}
                Ok(false) => allowed = false,
                Err(_) => {
                    tracing::error!("intercept callback {id} panicked, removing it");
                    remove.push(id);
                }
            }
        }
        if !remove.is_empty() {
            let mut guard = self.inner.callbacks.write();
            for id in remove {
                guard.remove(&id);
            }
        }
        allowed
    }
}

struct PendingInner {
    count: AtomicUsize,
    idle: Notify,
}

/// Counts outstanding asynchronous operations so teardown can wait for
/// quiescence. Cloning shares the counter.
#[derive(Clone)]
pub struct PendingOps {
    inner: Arc<PendingInner>,
}

impl Default for PendingOps {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingOps {
    #[must_use]
    pub fn new() -> Self {
        PendingOps {
            inner: Arc::new(PendingInner {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Scoped increment; the count drops when the guard does.
    #[must_use]
    pub fn guard(&self) -> PendingGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        PendingGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Wait until the count reaches zero or the timeout elapses. Returns
    /// `true` on quiescence.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count() == 0 {
                return true;
            }
            let notified = self.inner.idle.notified();
            if self.count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

pub struct PendingGuard {
    inner: Arc<PendingInner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn handle_drop_detaches() {
        let registry: CallbackRegistry<u32> = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        let handle = registry.add(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
            true
        });

        registry.dispatch(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(handle);
        registry.dispatch(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn disable_keeps_callback_registered() {
        let registry: CallbackRegistry<u32> = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        registry
            .add(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
                true
            })
            .disable();

        registry.dispatch(&1);
        registry.dispatch(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn false_return_unsubscribes() {
        let registry: CallbackRegistry<u32> = CallbackRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        registry
            .add(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
                false
            })
            .disable();

        registry.dispatch(&1);
        registry.dispatch(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_is_removed_and_counted() {
        let registry: CallbackRegistry<u32> = CallbackRegistry::new();
        registry.add(|_| panic!("boom")).disable();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        registry
            .add(move |_| {
                hits2.fetch_add(1, Ordering::SeqCst);
                true
            })
            .disable();

        assert_eq!(registry.dispatch(&1), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.dispatch(&2), 0);
    }

    #[test]
    fn filter_veto_does_not_unsubscribe() {
        let registry: FilterRegistry<u32> = FilterRegistry::new();
        registry.add(|v: &mut u32| *v != 13).disable();
        assert!(registry.dispatch_mut(&mut 1));
        assert!(!registry.dispatch_mut(&mut 13));
        assert!(registry.dispatch_mut(&mut 2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn filter_callbacks_may_mutate_the_event() {
        let registry: FilterRegistry<u32> = FilterRegistry::new();
        registry
            .add(|v: &mut u32| {
                *v += 1;
                true
            })
            .disable();

        let mut event = 41;
        assert!(registry.dispatch_mut(&mut event));
        assert_eq!(event, 42);
    }

    #[tokio::test]
    async fn pending_ops_wait_idle() {
        let pending = PendingOps::new();
        assert!(pending.wait_idle(Duration::from_millis(10)).await);

        let guard = pending.guard();
        assert_eq!(pending.count(), 1);
        assert!(!pending.wait_idle(Duration::from_millis(50)).await);

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.expect("join"));
    }
}
