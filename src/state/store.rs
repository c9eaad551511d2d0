//! Per-task status tracking and response cache
//!
//! Every task owns two status slots: the *primary* result status and the
//! *acknowledged* (after-callback) status. Waiting on the store is done with
//! predicate futures that are either ready immediately or registered on the
//! store's [`Notifier`] and resolved by the first qualifying mutation.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::state::notifier::{Notifier, Observer};

/// Result status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not settled yet
    Pending,
    /// Settled successfully (and passed validation)
    Fulfilled,
    /// Failed natively or was refused by its validator
    Rejected,
}

impl TaskStatus {
    #[inline]
    pub fn is_settled(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

/// Acknowledgement status of a task's result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckStatus {
    Pending,
    Fulfilled,
}

/// Status slot pair for one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub primary: TaskStatus,
    pub acknowledged: AckStatus,
}

impl StatusEntry {
    fn pending() -> Self {
        Self {
            primary: TaskStatus::Pending,
            acknowledged: AckStatus::Pending,
        }
    }

    fn is_terminal(&self) -> bool {
        self.primary.is_settled() && self.acknowledged == AckStatus::Fulfilled
    }
}

/// Aggregate counts over the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub fulfilled: usize,
    pub rejected: usize,
    pub acknowledged: usize,
}

#[derive(Debug, Default)]
struct StatusTable {
    /// Names in the order they were first initialized
    order: Vec<String>,
    entries: HashMap<String, StatusEntry>,
}

impl StatusTable {
    fn is_completed(&self) -> bool {
        self.entries.values().all(StatusEntry::is_terminal)
    }

    fn is_fulfilled(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.primary == TaskStatus::Fulfilled)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

/// Shared status and cache store for one batch
///
/// Cloning is cheap; clones observe and mutate the same store.
#[derive(Clone, Default)]
pub struct StatusStore {
    table: Arc<Mutex<StatusTable>>,
    cache: Arc<DashMap<String, Value>>,
    notifier: Arc<Notifier>,
}

impl std::fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStore")
            .field("summary", &self.summary())
            .field("cached", &self.cache.len())
            .field("waiters", &self.notifier.len())
            .finish()
    }
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifier fired on every status mutation
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Create a pending slot pair for `name` the first time it is seen.
    ///
    /// Both slots live in one [`StatusEntry`], so a half-initialized pair
    /// cannot exist; an existing entry is left as it is.
    pub fn init(&self, name: &str) {
        let mut table = self.table.lock();
        if table.entries.contains_key(name) {
            return;
        }
        table.order.push(name.to_string());
        table.entries.insert(name.to_string(), StatusEntry::pending());
    }

    /// Set the primary status of an initialized task.
    ///
    /// Moving a task back to `Pending` is reserved for [`reset_rejected`] and
    /// [`reset`]; such requests are ignored.
    ///
    /// [`reset_rejected`]: StatusStore::reset_rejected
    /// [`reset`]: StatusStore::reset
    pub fn update(&self, name: &str, status: TaskStatus) {
        {
            let mut table = self.table.lock();
            match table.entries.get_mut(name) {
                Some(entry) if status.is_settled() => entry.primary = status,
                Some(_) => debug!(task = %name, "Ignoring transition back to pending"),
                None => debug!(task = %name, "Ignoring status update for uninitialized task"),
            }
        }
        self.notifier.notify_all();
    }

    /// Current primary status, if the task is initialized
    pub fn observe(&self, name: &str) -> Option<TaskStatus> {
        self.table.lock().entries.get(name).map(|entry| entry.primary)
    }

    /// Current acknowledgement status, if the task is initialized
    pub fn observe_ack(&self, name: &str) -> Option<AckStatus> {
        self.table
            .lock()
            .entries
            .get(name)
            .map(|entry| entry.acknowledged)
    }

    pub fn get_cached(&self, name: &str) -> Option<Value> {
        self.cache.get(name).map(|entry| entry.value().clone())
    }

    pub fn put_cached(&self, name: &str, value: Value) {
        self.cache.insert(name.to_string(), value);
    }

    /// Names currently rejected, in initialization order
    pub fn list_rejected(&self) -> Vec<String> {
        let table = self.table.lock();
        table
            .order
            .iter()
            .filter(|name| {
                table
                    .entries
                    .get(name.as_str())
                    .is_some_and(|entry| entry.primary == TaskStatus::Rejected)
            })
            .cloned()
            .collect()
    }

    /// Return every rejected task to pending so it can run again.
    ///
    /// Acknowledgement slots and the cache are left untouched.
    pub fn reset_rejected(&self) {
        let mut table = self.table.lock();
        for entry in table.entries.values_mut() {
            if entry.primary == TaskStatus::Rejected {
                entry.primary = TaskStatus::Pending;
            }
        }
    }

    /// Mark an initialized task's result as acknowledged
    pub fn mark_acknowledged(&self, name: &str) {
        {
            let mut table = self.table.lock();
            if let Some(entry) = table.entries.get_mut(name) {
                entry.acknowledged = AckStatus::Fulfilled;
            }
        }
        self.notifier.notify_all();
    }

    /// Drop every status entry and cached value
    pub fn reset(&self) {
        self.table.lock().clear();
        self.cache.clear();
        self.notifier.notify_all();
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> StatusSummary {
        let table = self.table.lock();
        let mut summary = StatusSummary {
            total: table.entries.len(),
            ..Default::default()
        };
        for entry in table.entries.values() {
            match entry.primary {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Fulfilled => summary.fulfilled += 1,
                TaskStatus::Rejected => summary.rejected += 1,
            }
            if entry.acknowledged == AckStatus::Fulfilled {
                summary.acknowledged += 1;
            }
        }
        summary
    }

    /// Resolves `true` once every task is settled and acknowledged.
    ///
    /// Ready immediately when that already holds. Never resolves while some
    /// task stays unacknowledged; callers bound the wait with a timeout.
    pub async fn await_completed(&self) -> bool {
        self.wait_until(StatusTable::is_completed).await
    }

    /// Waits for [`await_completed`](StatusStore::await_completed), then
    /// reports whether every task was fulfilled.
    pub async fn await_fulfilled(&self) -> bool {
        if !self.await_completed().await {
            return false;
        }
        self.table.lock().is_fulfilled()
    }

    async fn wait_until(&self, predicate: fn(&StatusTable) -> bool) -> bool {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(PredicateWaiter {
            table: Arc::clone(&self.table),
            predicate,
            tx: Mutex::new(Some(tx)),
        });

        // Subscribe before checking so no mutation slips between the two.
        let _subscription = self.notifier.subscribe_guarded(waiter);
        let satisfied = predicate(&self.table.lock());
        if satisfied {
            return true;
        }

        rx.await.is_ok()
    }
}

/// Observer that fires a oneshot the first time its predicate holds
struct PredicateWaiter {
    table: Arc<Mutex<StatusTable>>,
    predicate: fn(&StatusTable) -> bool,
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Observer for PredicateWaiter {
    fn update(&self) {
        let satisfied = (self.predicate)(&self.table.lock());
        if satisfied {
            if let Some(tx) = self.tx.lock().take() {
                let _ = tx.send(());
            }
        }
    }
}
