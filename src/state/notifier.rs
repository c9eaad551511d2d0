//! Multi-subscriber change notification
//!
//! A `Notifier` decouples "something changed" from "who is waiting for it".
//! Observers register an [`Observer`] hook and every call to
//! [`Notifier::notify_all`] invokes each currently subscribed hook once,
//! synchronously, in no particular order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

/// Hook invoked on every notification
pub trait Observer: Send + Sync {
    /// Called once per `notify_all` dispatch
    fn update(&self);
}

impl<F> Observer for F
where
    F: Fn() + Send + Sync,
{
    fn update(&self) {
        self()
    }
}

/// Identity of a subscribed observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

/// Registry of observers
#[derive(Default)]
pub struct Notifier {
    observers: RwLock<HashMap<ObserverId, Arc<dyn Observer>>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("observers", &self.len())
            .finish()
    }
}

impl Notifier {
    /// Create a notifier with no observers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer, returning the id used to unsubscribe it
    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = ObserverId(Uuid::new_v4());
        self.observers.write().insert(id, observer);
        id
    }

    /// Register an observer for as long as the returned guard lives
    pub fn subscribe_guarded(self: &Arc<Self>, observer: Arc<dyn Observer>) -> Subscription {
        let id = self.subscribe(observer);
        Subscription {
            notifier: Arc::clone(self),
            id,
        }
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: ObserverId) {
        self.observers.write().remove(&id);
    }

    /// Invoke every subscribed observer once
    pub fn notify_all(&self) {
        // Dispatch on a snapshot so hooks may (un)subscribe without deadlocking.
        let snapshot: Vec<Arc<dyn Observer>> = self.observers.read().values().cloned().collect();
        for observer in snapshot {
            observer.update();
        }
    }

    /// Number of subscribed observers
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Guard that unsubscribes its observer when dropped
#[must_use = "dropping the subscription unsubscribes the observer"]
pub struct Subscription {
    notifier: Arc<Notifier>,
    id: ObserverId,
}

impl Subscription {
    pub fn id(&self) -> ObserverId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe(self.id);
    }
}
