//! # taskbatch
//!
//! Concurrency-bounded batch execution of named asynchronous tasks.
//!
//! ## Overview
//!
//! A [`TaskBatch`](batch::TaskBatch) holds a set of independent, named async
//! operations. Running the batch executes at most `limit` of them at a time
//! through a worker pool over a shared backlog. Every task gets a status
//! entry that can be awaited in aggregate, an optional response cache,
//! optional validation, and outcome callbacks.
//!
//! Completion is signalled in two phases: a task's *primary* status says
//! whether its result is known, and its *acknowledged* status says whether
//! downstream processing of that result is done. Tasks with callbacks
//! acknowledge themselves; the rest are acknowledged by the caller.
//!
//! ## Quick Start
//!
//! ```rust
//! use taskbatch::batch::{TaskArgs, TaskBatch, TaskDefinition, TaskError};
//! use serde_json::json;
//!
//! # async fn example() -> taskbatch::Result<()> {
//! let mut batch = TaskBatch::new();
//! batch.add(
//!     TaskDefinition::new("double")
//!         .with_operation(|args: TaskArgs| async move {
//!             let n = args.arg(0).as_i64().unwrap_or_default();
//!             Ok::<_, TaskError>(json!(n * 2))
//!         })
//!         .with_args(vec![json!(21)])
//!         .on_success(|value| value),
//! );
//!
//! let response = batch.run_and_wait_all_fulfilled(Some(4)).await?;
//! assert_eq!(response.value("double"), Some(&json!(42)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`state`]: status store, response cache and change notification
//! - [`batch`]: task definitions, executor, scheduler and the batch orchestrator

#![warn(rustdoc::missing_crate_level_docs)]

use std::time::Duration;

use thiserror::Error;

use crate::batch::TaskError;

/// Result type for batch operations
pub type Result<T> = std::result::Result<T, TaskBatchError>;

/// Main error type for batch operations
#[derive(Error, Debug)]
pub enum TaskBatchError {
    /// Task registered without an operation; aborts the worker chain running it
    #[error("Task '{0}' has no operation")]
    MissingOperation(String),

    /// Name not present in the batch registry
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// A task settled as rejected, natively or by its validator
    #[error("Task '{name}' failed: {error}")]
    Task {
        name: String,
        #[source]
        error: TaskError,
    },

    /// At least one task of the batch ended rejected
    #[error("Some task failed")]
    SomeTaskFailed,

    /// The completion wait ended without every task being terminal
    #[error("Batch did not complete")]
    Incomplete,

    /// The caller stopped waiting; work in flight keeps running
    #[error("Timed out after {0:?} waiting for batch")]
    Timeout(Duration),

    /// Join error from a worker task
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl TaskBatchError {
    /// Whether the error stops a worker chain rather than settling a task
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TaskBatchError::Task { .. })
    }
}

/// Status store and change notification
pub mod state;

/// Task definitions, execution and scheduling
pub mod batch;
