//! Retry workflow example
//!
//! Runs a small batch where some tasks reject, fixes their input and retries
//! only the failed ones.

use std::time::Duration;

use serde_json::json;
use taskbatch::batch::{TaskArgs, TaskBatch, TaskDefinition, TaskError};
use taskbatch::Result;

fn parse_port(name: &str, raw: &str) -> TaskDefinition {
    TaskDefinition::new(name)
        .with_operation(|args: TaskArgs| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let raw = args.arg(0).as_str().unwrap_or_default().to_string();
            match raw.parse::<u16>() {
                Ok(port) => Ok(json!(port)),
                Err(e) => Err(TaskError::rejected(json!({
                    "input": raw,
                    "reason": e.to_string(),
                }))),
            }
        })
        .with_args(vec![json!(raw)])
        .cached(true)
        .on_settled(|value| value)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("taskbatch=debug")
        .init();

    println!("Batch retry demonstration");
    println!("=========================\n");

    let mut batch = TaskBatch::new()
        .with_concurrency_limit(2)
        .with_wait_timeout(Duration::from_secs(5))
        .with_progress_callback(|settled, total| println!("  progress: {settled}/{total}"));

    batch.add_bulk(vec![
        parse_port("http", "80"),
        parse_port("https", "443"),
        parse_port("admin", "eighty"),
        parse_port("metrics", "99999"),
    ]);

    match batch.run_and_wait_all_fulfilled(None).await {
        Ok(_) => println!("All tasks fulfilled on the first run"),
        Err(e) => println!("First run: {e}; rejected: {:?}", batch.status().list_rejected()),
    }

    batch.set_task_args("admin", vec![json!("8080")])?;
    batch.set_task_args("metrics", vec![json!("9090")])?;

    let response = batch.retry_failed(None).await?;
    println!("\nAfter retry:");
    for name in batch.task_names() {
        println!("  {name}: {:?}", response.get(name));
    }
    println!("\nSummary: {:?}", batch.status().summary());

    Ok(())
}
