//! Batch orchestrator
//!
//! [`TaskBatch`] owns the task registry, the status store and the response
//! map of one batch, and exposes the batch-level operations: run and wait,
//! acknowledge, retry the rejected tasks, and reset.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::batch::executor::TaskExecutor;
use crate::batch::scheduler::{RunReport, Scheduler, SharedResponse};
use crate::batch::types::{
    BatchConfig, BatchResponse, ProgressCallback, TaskDefinition, TaskRegistry,
};
use crate::state::StatusStore;
use crate::{Result, TaskBatchError};

/// A set of named tasks run together under one concurrency limit
#[derive(Default)]
pub struct TaskBatch {
    registry: TaskRegistry,
    store: StatusStore,
    response: SharedResponse,
    config: BatchConfig,
    progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for TaskBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBatch")
            .field("tasks", &self.registry.names())
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

impl TaskBatch {
    /// Create an empty batch with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the limit used by runs that are given none
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = Some(limit);
        self
    }

    /// Bound the waits of the run-and-wait entry points
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.wait_timeout = Some(timeout);
        self
    }

    /// Set progress callback, invoked with `(settled, total)` during runs
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Register `task` unless a task with the same name exists.
    /// Returns whether it was registered.
    pub fn add(&mut self, task: TaskDefinition) -> bool {
        let inserted = self.registry.add(task);
        if !inserted {
            debug!("Task already registered, keeping existing definition");
        }
        inserted
    }

    /// Register every task, replacing same-named tasks
    pub fn add_bulk(&mut self, tasks: impl IntoIterator<Item = TaskDefinition>) {
        for task in tasks {
            self.registry.upsert(task);
        }
    }

    /// Replace the arguments of a registered task, typically before a retry
    pub fn set_task_args(&mut self, name: &str, args: Vec<Value>) -> Result<()> {
        let task = self
            .registry
            .get_mut(name)
            .ok_or_else(|| TaskBatchError::UnknownTask(name.to_string()))?;
        task.args.args = args;
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.registry.get(name).map(|task| task.as_ref())
    }

    /// Task names in registration order
    pub fn task_names(&self) -> &[String] {
        self.registry.names()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Status store of this batch
    pub fn status(&self) -> &StatusStore {
        &self.store
    }

    /// Snapshot of the responses collected so far
    pub fn response(&self) -> BatchResponse {
        self.response.lock().clone()
    }

    fn scheduler(&self) -> Scheduler {
        let scheduler = Scheduler::new(TaskExecutor::new(self.store.clone()));
        match &self.progress_callback {
            Some(callback) => {
                let callback = Arc::clone(callback);
                scheduler.with_progress_callback(move |settled, total| callback(settled, total))
            }
            None => scheduler,
        }
    }

    fn resolve_limit(&self, limit: Option<usize>) -> Option<usize> {
        limit.or(self.config.concurrency_limit)
    }

    /// Run every registered task without waiting for acknowledgement
    pub async fn run_all(&self, limit: Option<usize>) -> Result<RunReport> {
        self.scheduler()
            .run_all(&self.registry, self.resolve_limit(limit), &self.response)
            .await
    }

    /// Run every task, then wait until all are settled and acknowledged.
    ///
    /// Fails with [`TaskBatchError::SomeTaskFailed`] when any task ended
    /// rejected; inspect [`status`](TaskBatch::status) or
    /// [`response`](TaskBatch::response) for details.
    #[instrument(skip(self), fields(tasks = self.registry.len()))]
    pub async fn run_and_wait_all_fulfilled(&self, limit: Option<usize>) -> Result<BatchResponse> {
        self.run_all(limit).await?;
        if self.bounded(self.store.await_fulfilled()).await? {
            Ok(self.response())
        } else {
            Err(TaskBatchError::SomeTaskFailed)
        }
    }

    /// Run every task, then wait until all are settled and acknowledged
    #[instrument(skip(self), fields(tasks = self.registry.len()))]
    pub async fn run_and_wait_all_completed(&self, limit: Option<usize>) -> Result<BatchResponse> {
        self.run_all(limit).await?;
        if self.bounded(self.store.await_completed()).await? {
            Ok(self.response())
        } else {
            Err(TaskBatchError::Incomplete)
        }
    }

    /// Wait at most `timeout` for every task to be settled and acknowledged
    pub async fn wait_completed_for(&self, timeout: Duration) -> Result<bool> {
        tokio::time::timeout(timeout, self.store.await_completed())
            .await
            .map_err(|_| TaskBatchError::Timeout(timeout))
    }

    /// Wait at most `timeout` for completion, then report whether every
    /// task was fulfilled
    pub async fn wait_fulfilled_for(&self, timeout: Duration) -> Result<bool> {
        tokio::time::timeout(timeout, self.store.await_fulfilled())
            .await
            .map_err(|_| TaskBatchError::Timeout(timeout))
    }

    /// Apply the configured wait timeout, if any. Tasks keep running after
    /// the caller gives up.
    async fn bounded<F: Future<Output = bool>>(&self, wait: F) -> Result<bool> {
        match self.config.wait_timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| TaskBatchError::Timeout(timeout)),
            None => Ok(wait.await),
        }
    }

    /// Acknowledge every initialized task that has no outcome callback
    pub fn acknowledge_all(&self) {
        for task in self.registry.iter() {
            self.acknowledge(task);
        }
    }

    /// Acknowledge one task if it is initialized and has no outcome callback
    pub fn acknowledge_one(&self, name: &str) -> Result<()> {
        let task = self
            .registry
            .get(name)
            .ok_or_else(|| TaskBatchError::UnknownTask(name.to_string()))?;
        self.acknowledge(task);
        Ok(())
    }

    fn acknowledge(&self, task: &TaskDefinition) {
        if self.store.observe(&task.name).is_none() {
            return;
        }
        if task.has_outcome_callback() {
            debug!(task = %task.name, "Task acknowledges through its callback, skipping");
            return;
        }
        self.store.mark_acknowledged(&task.name);
    }

    /// Re-run only the tasks that are currently rejected.
    ///
    /// Their responses replace the earlier ones in the batch response, which
    /// is returned. Fulfilled tasks are never re-run.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, limit: Option<usize>) -> Result<BatchResponse> {
        let rejected = self.store.list_rejected();
        if rejected.is_empty() {
            debug!("No rejected tasks to retry");
            return Ok(self.response());
        }

        info!(count = rejected.len(), "Retrying rejected tasks");
        self.store.reset_rejected();

        let retried = SharedResponse::default();
        self.scheduler()
            .run_subset(&self.registry, &rejected, self.resolve_limit(limit), &retried)
            .await?;

        let retried = std::mem::take(&mut *retried.lock());
        let mut response = self.response.lock();
        response.merge(retried);
        Ok(response.clone())
    }

    /// Clear the collected responses and every status entry
    pub fn reset(&self) {
        self.response.lock().clear();
        self.store.reset();
    }
}
