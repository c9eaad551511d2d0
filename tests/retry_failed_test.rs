//! Retry tests
//!
//! Rejected tasks can be fixed by the caller and re-run without touching the
//! tasks that already fulfilled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use taskbatch::batch::{BatchConfig, TaskArgs, TaskBatch, TaskDefinition, TaskError};
use taskbatch::state::TaskStatus;
use taskbatch::TaskBatchError;
use tokio_test::{assert_err, assert_ok};

type CallLog = Arc<Mutex<HashMap<String, usize>>>;

/// Task that fails for negative inputs and records every invocation
fn non_negative(name: &str, input: i64, log: CallLog) -> TaskDefinition {
    let label = name.to_string();
    TaskDefinition::new(name)
        .with_operation(move |args: TaskArgs| {
            *log.lock().entry(label.clone()).or_default() += 1;
            async move {
                match args.arg(0).as_i64() {
                    Some(n) if n >= 0 => Ok(json!(n * 10)),
                    _ => Err(TaskError::rejected(json!({ "input": args.arg(0).clone() }))),
                }
            }
        })
        .with_args(vec![json!(input)])
        .on_settled(|v| v)
}

#[tokio::test]
async fn test_retry_failed_reruns_only_rejected_tasks() {
    let log = CallLog::default();
    let mut batch = TaskBatch::new().with_config(BatchConfig::default().with_concurrency_limit(2));
    batch.add(non_negative("a", 1, log.clone()));
    batch.add(non_negative("b", -1, log.clone()));
    batch.add(non_negative("c", 2, log.clone()));
    batch.add(non_negative("d", -4, log.clone()));

    let error = assert_err!(batch.run_and_wait_all_fulfilled(None).await);
    assert!(matches!(error, TaskBatchError::SomeTaskFailed));
    assert_eq!(batch.status().list_rejected(), vec!["b".to_string(), "d".to_string()]);

    batch.set_task_args("b", vec![json!(3)]).expect("b is registered");
    batch.set_task_args("d", vec![json!(4)]).expect("d is registered");
    let response = batch.retry_failed(None).await.expect("retry should run");

    assert!(batch.status().list_rejected().is_empty());
    assert!(batch
        .wait_fulfilled_for(Duration::from_secs(1))
        .await
        .expect("should complete"));
    assert_eq!(response.len(), 4);
    assert_eq!(response.value("b"), Some(&json!(30)));
    assert_eq!(response.value("d"), Some(&json!(40)));

    let calls = log.lock();
    assert_eq!(calls["a"], 1);
    assert_eq!(calls["c"], 1);
    assert_eq!(calls["b"], 2);
    assert_eq!(calls["d"], 2);
}

#[tokio::test]
async fn test_retry_without_fix_rejects_again() {
    let log = CallLog::default();
    let mut batch = TaskBatch::new();
    batch.add(non_negative("bad", -1, log.clone()));

    assert_ok!(batch.run_all(None).await);
    let response = assert_ok!(batch.retry_failed(Some(1)).await);

    assert_eq!(batch.status().observe("bad"), Some(TaskStatus::Rejected));
    assert_eq!(
        response.error("bad"),
        Some(&TaskError::rejected(json!({ "input": -1 })))
    );
    assert_eq!(log.lock()["bad"], 2);
}

#[tokio::test]
async fn test_retry_with_nothing_rejected_runs_nothing() {
    let log = CallLog::default();
    let mut batch = TaskBatch::new();
    batch.add(non_negative("ok", 5, log.clone()));

    let first = batch
        .run_and_wait_all_fulfilled(None)
        .await
        .expect("batch should fulfil");
    let after_retry = batch.retry_failed(None).await.expect("retry is a no-op");

    assert_eq!(first, after_retry);
    assert_eq!(log.lock()["ok"], 1);
}

#[tokio::test]
async fn test_lazy_rejected_task_response_is_replaced_by_retry() {
    let mut batch = TaskBatch::new();
    let log = CallLog::default();
    batch.add(non_negative("lazy", -1, log).lazy(true));

    batch.run_all(None).await.expect("run should succeed");
    batch.set_task_args("lazy", vec![json!(1)]).expect("registered");
    let response = batch.retry_failed(None).await.expect("retry should run");

    assert_eq!(response.value("lazy"), Some(&json!(10)));
    assert_eq!(batch.status().observe("lazy"), Some(TaskStatus::Fulfilled));
}
