//! Single-task execution pipeline
//!
//! Runs one task end to end against the shared [`StatusStore`]:
//! - short-circuit tasks that are already fulfilled
//! - invoke the operation and validate its response
//! - dispatch the matching outcome callback and `on_settled`
//! - cache fulfilled responses and record the outcome
//! - acknowledge the result when a callback handled it

use std::time::Instant;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::batch::types::{TaskDefinition, TaskError};
use crate::state::{StatusStore, TaskStatus};
use crate::{Result, TaskBatchError};

/// Executes individual tasks against a status store
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    store: StatusStore,
}

impl TaskExecutor {
    pub fn new(store: StatusStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Run `task` once.
    ///
    /// Returns `Ok(Some(response))` when the task is fulfilled and
    /// `Ok(None)` when it was already fulfilled earlier and is not cached.
    /// A rejection surfaces as [`TaskBatchError::Task`]; a task without an
    /// operation as [`TaskBatchError::MissingOperation`].
    #[instrument(skip(self, task), fields(task = %task.name))]
    pub async fn run(&self, task: &TaskDefinition) -> Result<Option<Value>> {
        let name = task.name.as_str();

        if self.store.observe(name) == Some(TaskStatus::Fulfilled) {
            debug!(cached = task.cached, "Task already fulfilled, not invoking");
            return Ok(if task.cached {
                self.store.get_cached(name)
            } else {
                None
            });
        }

        self.store.init(name);

        let operation = task
            .operation
            .as_ref()
            .ok_or_else(|| TaskBatchError::MissingOperation(task.name.clone()))?;

        let start = Instant::now();
        debug!("Invoking operation");
        let outcome = match operation.call(task.args.clone()).await {
            Ok(response) => Self::validate(task, response),
            // Native rejections never reach the validator
            Err(error) => Err(error),
        };

        let status = if outcome.is_ok() {
            TaskStatus::Fulfilled
        } else {
            TaskStatus::Rejected
        };

        let handled = match &outcome {
            Ok(_) => task.on_success.is_some(),
            Err(_) => task.on_failure.is_some(),
        } || task.on_settled.is_some();

        let outcome = if handled {
            Self::apply_callbacks(task, outcome)
        } else {
            outcome
        };

        if let Ok(response) = &outcome {
            if task.cached {
                self.store.put_cached(name, response.clone());
            }
        }

        self.store.update(name, status);
        if handled {
            self.store.mark_acknowledged(name);
        } else {
            debug!("No callback for outcome, awaiting explicit acknowledgement");
        }

        let duration_ms = start.elapsed().as_millis();
        match outcome {
            Ok(response) => {
                debug!(duration_ms, "Task fulfilled");
                Ok(Some(response))
            }
            Err(error) => {
                warn!(duration_ms, error = %error, "Task rejected");
                Err(TaskBatchError::Task {
                    name: task.name.clone(),
                    error,
                })
            }
        }
    }

    fn validate(task: &TaskDefinition, response: Value) -> std::result::Result<Value, TaskError> {
        let Some(validate) = &task.validate else {
            return Ok(response);
        };

        // The validator sees its own copy; the stored response stays untouched.
        let probe = response.clone();
        if validate(&probe) {
            Ok(response)
        } else {
            debug!("Validator refused response");
            Err(TaskError::Invalid(response))
        }
    }

    fn apply_callbacks(
        task: &TaskDefinition,
        outcome: std::result::Result<Value, TaskError>,
    ) -> std::result::Result<Value, TaskError> {
        let outcome = match outcome {
            Ok(response) => Ok(match &task.on_success {
                Some(on_success) => on_success(response),
                None => response,
            }),
            Err(error) => Err(match &task.on_failure {
                Some(on_failure) => on_failure(error),
                None => error,
            }),
        };

        match &task.on_settled {
            Some(on_settled) => match outcome {
                Ok(response) => Ok(on_settled(response)),
                Err(error) => Err(error.map_payload(|payload| on_settled(payload))),
            },
            None => outcome,
        }
    }
}
