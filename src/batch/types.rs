use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure of a single task
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// The operation itself failed
    #[error("operation rejected: {0}")]
    Rejected(Value),

    /// The operation succeeded but its validator refused the response
    #[error("response failed validation: {0}")]
    Invalid(Value),
}

impl TaskError {
    /// Convenience constructor for a native rejection
    pub fn rejected(payload: impl Into<Value>) -> Self {
        TaskError::Rejected(payload.into())
    }

    pub fn payload(&self) -> &Value {
        match self {
            TaskError::Rejected(payload) | TaskError::Invalid(payload) => payload,
        }
    }

    /// Replace the payload, keeping the kind of failure
    pub fn map_payload(self, f: impl FnOnce(Value) -> Value) -> Self {
        match self {
            TaskError::Rejected(payload) => TaskError::Rejected(f(payload)),
            TaskError::Invalid(payload) => TaskError::Invalid(f(payload)),
        }
    }
}

/// Receiver context and ordered arguments handed to an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub context: Value,
    pub args: Vec<Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            context: Value::Null,
            args,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Argument at `index`, or `Value::Null` when absent
    pub fn arg(&self, index: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.args.get(index).unwrap_or(&NULL)
    }
}

/// Asynchronous unit of work behind a task
#[async_trait]
pub trait TaskOperation: Send + Sync {
    async fn call(&self, args: TaskArgs) -> Result<Value, TaskError>;
}

#[async_trait]
impl<F, Fut> TaskOperation for F
where
    F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn call(&self, args: TaskArgs) -> Result<Value, TaskError> {
        self(args).await
    }
}

pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type SuccessCallback = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(TaskError) -> TaskError + Send + Sync>;
pub type SettledCallback = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Named unit of work registered into a batch
#[derive(Clone)]
pub struct TaskDefinition {
    /// Unique identifier within a batch
    pub name: String,
    /// Work to perform; a task without one fails its worker chain
    pub operation: Option<Arc<dyn TaskOperation>>,
    /// Arguments passed to every invocation
    pub args: TaskArgs,
    /// Keep the last fulfilled response and return it on re-runs
    pub cached: bool,
    /// Never overwrite an existing batch response entry for this task
    pub lazy: bool,
    pub validate: Option<Validator>,
    pub on_success: Option<SuccessCallback>,
    pub on_failure: Option<FailureCallback>,
    /// Runs after `on_success`/`on_failure`; on failure it maps the error payload
    pub on_settled: Option<SettledCallback>,
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("operation", &self.operation.is_some())
            .field("args", &self.args)
            .field("cached", &self.cached)
            .field("lazy", &self.lazy)
            .field("validate", &self.validate.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

impl TaskDefinition {
    /// Create a task with no operation and no callbacks
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: None,
            args: TaskArgs::default(),
            cached: false,
            lazy: false,
            validate: None,
            on_success: None,
            on_failure: None,
            on_settled: None,
        }
    }

    pub fn with_operation<O>(mut self, operation: O) -> Self
    where
        O: TaskOperation + 'static,
    {
        self.operation = Some(Arc::new(operation));
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args.args = args;
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.args.context = context;
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(TaskError) -> TaskError + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    pub fn on_settled<F>(mut self, callback: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(callback));
        self
    }

    /// Whether the task carries a success or failure callback
    pub fn has_outcome_callback(&self) -> bool {
        self.on_success.is_some() || self.on_failure.is_some()
    }
}

/// Registered tasks in registration order
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    order: Vec<String>,
    tasks: HashMap<String, Arc<TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `task` unless its name is taken. Returns whether it was inserted.
    pub fn add(&mut self, task: TaskDefinition) -> bool {
        if self.tasks.contains_key(&task.name) {
            return false;
        }
        self.order.push(task.name.clone());
        self.tasks.insert(task.name.clone(), Arc::new(task));
        true
    }

    /// Insert `task`, replacing a same-named task in its original position
    pub fn upsert(&mut self, task: TaskDefinition) {
        if !self.tasks.contains_key(&task.name) {
            self.order.push(task.name.clone());
        }
        self.tasks.insert(task.name.clone(), Arc::new(task));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TaskDefinition>> {
        self.tasks.get(name)
    }

    /// Mutable access; clones the definition if a run still holds it
    pub fn get_mut(&mut self, name: &str) -> Option<&mut TaskDefinition> {
        self.tasks.get_mut(name).map(Arc::make_mut)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Task names in registration order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TaskDefinition>> {
        self.order.iter().filter_map(|name| self.tasks.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.tasks.clear();
    }
}

/// Final response of one task: `Ok(None)` is the "no result" marker of a
/// task that was already fulfilled and is not cached
pub type TaskOutput = Result<Option<Value>, TaskError>;

/// Responses of a batch keyed by task name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    entries: HashMap<String, TaskOutput>,
}

impl BatchResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&TaskOutput> {
        self.entries.get(name)
    }

    /// Fulfilled value of a task, if it produced one
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.entries.get(name) {
            Some(Ok(Some(value))) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self, name: &str) -> Option<&TaskError> {
        match self.entries.get(name) {
            Some(Err(error)) => Some(error),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, output: TaskOutput) {
        self.entries.insert(name.into(), output);
    }

    /// Merge `other` into this response, overwriting same-named entries
    pub fn merge(&mut self, other: BatchResponse) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TaskOutput)> {
        self.entries.iter()
    }
}

/// Batch execution configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Limit used when a run is given none; `None` runs every task at once
    pub concurrency_limit: Option<usize>,
    /// Bound for the timed waits; `None` waits forever
    pub wait_timeout: Option<Duration>,
}

impl BatchConfig {
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

/// Progress callback: `(settled, total)`
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_definition_builder() {
        let task = TaskDefinition::new("fetch")
            .with_operation(|args: TaskArgs| async move {
                Ok::<_, TaskError>(args.arg(0).clone())
            })
            .with_args(vec![json!(1)])
            .cached(true)
            .on_success(|value| value);

        assert_eq!(task.name, "fetch");
        assert!(task.operation.is_some());
        assert!(task.cached);
        assert!(!task.lazy);
        assert!(task.has_outcome_callback());
        assert_eq!(task.args.arg(0), &json!(1));
        assert_eq!(task.args.arg(5), &Value::Null);
    }

    #[test]
    fn test_task_error_map_payload_keeps_kind() {
        let error = TaskError::Invalid(json!(3)).map_payload(|v| json!({ "wrapped": v }));
        assert_eq!(error, TaskError::Invalid(json!({ "wrapped": 3 })));
        assert_eq!(error.payload(), &json!({ "wrapped": 3 }));
    }

    #[test]
    fn test_batch_response_accessors() {
        let mut response = BatchResponse::new();
        response.insert("ok", Ok(Some(json!("done"))));
        response.insert("skipped", Ok(None));
        response.insert("bad", Err(TaskError::rejected("boom")));

        assert_eq!(response.len(), 3);
        assert_eq!(response.value("ok"), Some(&json!("done")));
        assert_eq!(response.value("skipped"), None);
        assert_eq!(response.error("bad"), Some(&TaskError::rejected("boom")));
    }

    #[test]
    fn test_batch_config_deserializes_with_defaults() {
        let config: BatchConfig = serde_json::from_value(json!({ "concurrency_limit": 3 }))
            .expect("config should deserialize");
        assert_eq!(config.concurrency_limit, Some(3));
        assert_eq!(config.wait_timeout, None);
    }
}
