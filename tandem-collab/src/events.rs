//! Callback registry with owned subscription handles.
//!
//! Every change stream (`on_shapes_change`, `on_connection_state_change`, ...)
//! is a [`Listeners`] instance. Registering returns a [`Subscription`];
//! calling [`Subscription::unsubscribe`] removes the callback. Dropping the
//! handle without unsubscribing keeps the callback registered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Slots<T> = Mutex<Vec<(u64, Callback<T>)>>;

/// Ordered set of callbacks for one event type.
pub struct Listeners<T> {
    slots: Arc<Slots<T>>,
    next_id: AtomicU64,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback`; it runs for every subsequent `emit`.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));

        let slots: Weak<Slots<T>> = Arc::downgrade(&self.slots);
        Subscription {
            remove: Some(Box::new(move || {
                slots.upgrade().map_or(false, |slots| {
                    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
                    let before = slots.len();
                    slots.retain(|(slot_id, _)| *slot_id != id);
                    slots.len() != before
                })
            })),
        }
    }

    /// Invoke every callback with `value`.
    ///
    /// The callback list is snapshotted first, so callbacks may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by every `on_*` registration.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() -> bool + Send>>,
}

impl Subscription {
    /// Remove the callback. Returns `false` if the source was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.remove.take().map_or(false, |remove| remove())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
