//! A three-stage pipeline mixing threads and cooperative tasks.
//!
//! Run with: cargo run --example pipeline

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use flowgate::{
    Envelope, MemoryQueue, Pipeline, PipelineConfig, RetryPolicy, SharedQueue, TaskFn, TaskResult,
};
use futures::StreamExt;

/// Simulated blocking I/O.
fn fetch(id: u64) -> TaskResult<u64> {
    std::thread::sleep(Duration::from_millis(20));
    if id % 17 == 0 {
        return Err(anyhow!("fetch {id}: connection reset"));
    }
    Ok(id)
}

/// CPU-bound mixing.
fn mix(mut x: u64) -> TaskResult<u64> {
    for _ in 0..10_000 {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
    }
    Ok(x)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flowgate=info".into()),
        )
        .init();

    let wait: SharedQueue<Envelope<u64>> = Arc::new(MemoryQueue::new());
    let done: SharedQueue<Envelope<u64>> = Arc::new(MemoryQueue::new());
    for id in 1..=500 {
        wait.put(Envelope::Item(id), false, None)?;
    }

    let config = PipelineConfig::default()
        .with_retry(RetryPolicy::limited(3))
        .with_log_interval(Duration::from_millis(500));
    let mut pipeline = Pipeline::with_config(wait, done.clone(), config);

    pipeline
        .register_thread(TaskFn::function(fetch), 16, None)?
        .register_coroutine(
            TaskFn::stream(|id: u64| {
                futures::stream::iter([id, id + 1_000_000]).then(|part| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(part)
                })
            }),
            64,
            Some("split"),
        )?
        .register_thread(TaskFn::function(mix), 4, None)?;

    pipeline.run()?;

    let errors: usize = pipeline.status().iter().map(|s| s.error).sum();
    println!("done={} errors={errors}", done.len());
    Ok(())
}
