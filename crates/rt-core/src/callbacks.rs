//! Ordered callback fan-out.
//!
//! Room and session lifecycle events are delivered to an open-ended set of
//! listeners. [`CallbackList`] pins down the semantics: listeners fire in
//! registration order, each listener fires at most once per event, and a
//! listener registered while an event is being dispatched only sees later
//! events. There is no unregister — listeners live as long as their owner.

use std::sync::{Arc, Mutex};

/// A boxed listener invoked with a borrowed event value.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An append-only list of listeners with ordered, at-most-once dispatch.
pub struct CallbackList<T> {
    inner: Mutex<Vec<Callback<T>>>,
}

impl<T> Default for CallbackList<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }
}

impl<T> CallbackList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners accumulate for the list's lifetime.
    pub fn push(&self, cb: impl Fn(&T) + Send + Sync + 'static) {
        self.push_arc(Arc::new(cb));
    }

    /// Register an already-shared listener.
    pub fn push_arc(&self, cb: Callback<T>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.push(cb);
        }
    }

    /// The listeners registered so far, in registration order.
    ///
    /// Lets a caller pair the snapshot with other state under its own lock
    /// and invoke later, outside that lock.
    pub fn snapshot(&self) -> Vec<Callback<T>> {
        self.inner.lock().map(|inner| inner.clone()).unwrap_or_default()
    }

    /// Invoke every listener registered before this call, in registration
    /// order. The lock is not held during invocation, so listeners may
    /// register further listeners without deadlocking.
    pub fn invoke(&self, value: &T) {
        for cb in self.snapshot() {
            cb(value);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
