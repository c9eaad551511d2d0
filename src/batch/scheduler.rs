use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument};

use crate::batch::executor::TaskExecutor;
use crate::batch::types::{
    BatchResponse, ProgressCallback, TaskDefinition, TaskOutput, TaskRegistry,
};
use crate::{Result, TaskBatchError};

/// Response map shared between the workers of a run and the batch
pub type SharedResponse = Arc<Mutex<BatchResponse>>;

/// Outcome of one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Tasks handed to the run
    pub scheduled: usize,
    /// Tasks that settled (fulfilled, rejected or short-circuited)
    pub settled: usize,
    /// Workers started
    pub workers: usize,
}

/// Bounded worker pool over a shared FIFO backlog
pub struct Scheduler {
    executor: TaskExecutor,
    progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("executor", &self.executor)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Scheduler {
    pub fn new(executor: TaskExecutor) -> Self {
        Self {
            executor,
            progress_callback: None,
        }
    }

    /// Set progress callback, invoked with `(settled, total)` after each task
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Run every registered task, at most `limit` at a time
    pub async fn run_all(
        &self,
        registry: &TaskRegistry,
        limit: Option<usize>,
        response: &SharedResponse,
    ) -> Result<RunReport> {
        self.run_subset(registry, registry.names(), limit, response)
            .await
    }

    /// Run the named tasks, at most `limit` at a time.
    ///
    /// A `limit` of `None`, zero, or more than `names.len()` runs every task
    /// at once. Returns when every worker has drained the backlog or aborted.
    ///
    /// A fatal error (a task without an operation, an unknown name) stops
    /// only the chain that hit it; the other workers keep draining the
    /// backlog. The first fatal error is returned once every worker is done.
    #[instrument(skip_all, fields(task_count = names.len()))]
    pub async fn run_subset(
        &self,
        registry: &TaskRegistry,
        names: &[String],
        limit: Option<usize>,
        response: &SharedResponse,
    ) -> Result<RunReport> {
        let total = names.len();
        let limit = match limit {
            Some(limit) if limit > 0 && limit <= total => limit,
            _ => total,
        };

        let mut report = RunReport {
            scheduled: total,
            workers: limit,
            ..Default::default()
        };

        if total == 0 {
            debug!("No tasks to run");
            return Ok(report);
        }

        let batch_start = Instant::now();
        info!(total, limit, "Starting batch run");

        for name in names {
            if registry.contains(name) {
                self.executor.store().init(name);
            }
        }

        let tasks: Arc<HashMap<String, Arc<TaskDefinition>>> = Arc::new(
            names
                .iter()
                .filter_map(|name| registry.get(name).map(|task| (name.clone(), Arc::clone(task))))
                .collect(),
        );
        let backlog: VecDeque<String> = names[limit..].iter().cloned().collect();
        let backlog = Arc::new(Mutex::new(backlog));
        let settled = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = names[..limit]
            .iter()
            .enumerate()
            .map(|(id, first)| {
                let worker = Worker {
                    id,
                    executor: self.executor.clone(),
                    tasks: Arc::clone(&tasks),
                    backlog: Arc::clone(&backlog),
                    response: Arc::clone(response),
                    settled: Arc::clone(&settled),
                    progress: self.progress_callback.clone(),
                    total,
                };
                tokio::spawn(worker.run(first.clone()))
            })
            .collect();

        let mut join_error = None;
        let mut fatal = Vec::new();
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Some(error)) => fatal.push(error),
                Ok(None) => {}
                Err(e) => {
                    error!("Worker join error: {}", e);
                    join_error.get_or_insert(e);
                }
            }
        }

        report.settled = settled.load(Ordering::SeqCst);
        info!(
            total,
            settled = report.settled,
            aborted = fatal.len(),
            duration_ms = batch_start.elapsed().as_millis(),
            "Batch run completed"
        );

        if let Some(e) = join_error {
            return Err(TaskBatchError::Join(e));
        }
        match fatal.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }
}

/// One execution slot: runs its first task, then keeps popping the backlog
struct Worker {
    id: usize,
    executor: TaskExecutor,
    tasks: Arc<HashMap<String, Arc<TaskDefinition>>>,
    backlog: Arc<Mutex<VecDeque<String>>>,
    response: SharedResponse,
    settled: Arc<AtomicUsize>,
    progress: Option<ProgressCallback>,
    total: usize,
}

impl Worker {
    /// Returns the error that aborted this chain, if any
    async fn run(self, first: String) -> Option<TaskBatchError> {
        let mut next = Some(first);
        while let Some(name) = next {
            let Some(task) = self.tasks.get(&name) else {
                let error = TaskBatchError::UnknownTask(name.clone());
                error!(worker = self.id, task = %name, error = %error, "Aborting worker chain");
                return Some(error);
            };

            debug!(worker = self.id, task = %name, "Worker picked task");
            match self.executor.run(task).await {
                Ok(value) => self.record(task, Ok(value)),
                Err(TaskBatchError::Task { error, .. }) => self.record(task, Err(error)),
                Err(fatal) => {
                    error!(
                        worker = self.id,
                        task = %name,
                        error = %fatal,
                        "Aborting worker chain"
                    );
                    return Some(fatal);
                }
            }

            next = self.backlog.lock().pop_front();
        }
        debug!(worker = self.id, "Backlog drained, worker stopping");
        None
    }

    fn record(&self, task: &TaskDefinition, output: TaskOutput) {
        {
            let mut response = self.response.lock();
            if task.lazy && response.contains(&task.name) {
                debug!(task = %task.name, "Keeping existing response for lazy task");
            } else {
                response.insert(task.name.clone(), output);
            }
        }

        let settled = self.settled.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(ref callback) = self.progress {
            callback(settled, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::{TaskArgs, TaskError};
    use crate::state::{StatusStore, TaskStatus};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn sleeping_task(
        name: &str,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> TaskDefinition {
        TaskDefinition::new(name).with_operation(move |_: TaskArgs| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskError>(json!(true))
            }
        })
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(TaskExecutor::new(StatusStore::new()))
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        for i in 0..8 {
            registry.add(sleeping_task(&format!("task_{i}"), in_flight.clone(), peak.clone()));
        }
        let response = SharedResponse::default();

        let report = scheduler()
            .run_all(&registry, Some(3), &response)
            .await
            .expect("run should succeed");

        assert_eq!(report.workers, 3);
        assert_eq!(report.settled, 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(response.lock().len(), 8);
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let mut registry = TaskRegistry::new();
        for i in 0..4 {
            registry.add(sleeping_task(&format!("task_{i}"), Arc::default(), Arc::default()));
        }

        for limit in [None, Some(0), Some(99)] {
            let response = SharedResponse::default();
            let scheduler = scheduler();
            let report = scheduler
                .run_all(&registry, limit, &response)
                .await
                .expect("run should succeed");
            assert_eq!(report.workers, 4, "limit {limit:?} should clamp to task count");
        }
    }

    #[tokio::test]
    async fn test_tasks_start_in_registration_order_with_one_worker() {
        let started = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskRegistry::new();
        for name in ["b", "a", "c"] {
            let started = started.clone();
            let label = name.to_string();
            registry.add(TaskDefinition::new(name).with_operation(move |_: TaskArgs| {
                started.lock().push(label.clone());
                async { Ok::<_, TaskError>(Value::Null) }
            }));
        }

        scheduler()
            .run_all(&registry, Some(1), &SharedResponse::default())
            .await
            .expect("run should succeed");

        assert_eq!(*started.lock(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_missing_operation_aborts_only_its_chain() {
        let mut registry = TaskRegistry::new();
        registry.add(TaskDefinition::new("broken"));
        for i in 0..5 {
            registry.add(sleeping_task(&format!("task_{i}"), Arc::default(), Arc::default()));
        }
        let response = SharedResponse::default();
        let scheduler = scheduler();

        let error = scheduler
            .run_all(&registry, Some(2), &response)
            .await
            .expect_err("missing operation is reported");

        assert!(matches!(error, TaskBatchError::MissingOperation(ref name) if name == "broken"));
        assert_eq!(response.lock().len(), 5);
        assert!(!response.lock().contains("broken"));
        assert_eq!(scheduler.executor().store().observe("broken"), Some(TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_unknown_name_is_reported_after_other_chains_finish() {
        let mut registry = TaskRegistry::new();
        registry.add(sleeping_task("known", Arc::default(), Arc::default()));
        let names = vec!["ghost".to_string(), "known".to_string()];
        let response = SharedResponse::default();

        let error = scheduler()
            .run_subset(&registry, &names, Some(2), &response)
            .await
            .expect_err("unknown name is reported");

        assert!(matches!(error, TaskBatchError::UnknownTask(ref name) if name == "ghost"));
        assert!(response.lock().contains("known"));
    }

    #[tokio::test]
    async fn test_lazy_task_keeps_existing_response() {
        let mut registry = TaskRegistry::new();
        registry.add(
            TaskDefinition::new("lazy")
                .with_operation(|_: TaskArgs| async { Ok::<_, TaskError>(json!("fresh")) })
                .lazy(true),
        );
        let response = SharedResponse::default();
        response.lock().insert("lazy", Ok(Some(json!("stale"))));

        scheduler()
            .run_all(&registry, None, &response)
            .await
            .expect("run should succeed");

        assert_eq!(response.lock().value("lazy"), Some(&json!("stale")));
    }

    #[tokio::test]
    async fn test_progress_callback_reports_every_task() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskRegistry::new();
        for i in 0..3 {
            registry.add(sleeping_task(&format!("task_{i}"), Arc::default(), Arc::default()));
        }
        let scheduler = scheduler().with_progress_callback({
            let updates = updates.clone();
            move |settled, total| updates.lock().push((settled, total))
        });

        scheduler
            .run_all(&registry, Some(2), &SharedResponse::default())
            .await
            .expect("run should succeed");

        let updates = updates.lock();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates.last(), Some(&(3, 3)));
    }
}
