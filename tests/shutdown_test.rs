//! Shutdown protocol tests: parked workers, idempotence, no lost items.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowgate::{
    discard_sink, Envelope, MemoryQueue, Pipeline, PipelineConfig, RuntimeError, SharedQueue,
    TaskFn,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn empty_queues() -> (SharedQueue<Envelope<u64>>, SharedQueue<Envelope<u64>>) {
    (Arc::new(MemoryQueue::new()), Arc::new(MemoryQueue::new()))
}

fn no_poison(queue: &SharedQueue<Envelope<u64>>) -> bool {
    queue.snapshot().iter().all(|envelope| !envelope.is_poison())
}

#[test]
fn test_stop_unblocks_workers_parked_on_empty_queue() {
    init_tracing();
    let (wait, done) = empty_queues();
    let mut pipeline = Pipeline::new(wait.clone(), done).with_sink(discard_sink());
    pipeline
        .register_thread(TaskFn::function(|x: u64| Ok(x)), 4, Some("parked"))
        .unwrap()
        .register_thread(TaskFn::function(|x: u64| Ok(x)), 2, Some("downstream"))
        .unwrap()
        .register_coroutine(TaskFn::future(|x: u64| async move { Ok(x) }), 3, Some("async"))
        .unwrap();

    pipeline.start().unwrap();
    assert_eq!(pipeline.len(), 9);
    std::thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    assert!(pipeline.stop());
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(pipeline.len(), 0);
    assert!(!pipeline.is_running());
    for stage in pipeline.tracker().stages() {
        assert!(stage.wait_queue().is_empty(), "poison left in {}", stage.name());
    }
    assert!(wait.is_empty());
}

#[test]
fn test_stop_is_idempotent() {
    init_tracing();
    let (wait, done) = empty_queues();
    let mut pipeline = Pipeline::new(wait, done).with_sink(discard_sink());
    assert!(!pipeline.stop());

    pipeline
        .register_thread(TaskFn::function(|x: u64| Ok(x)), 2, None)
        .unwrap();
    pipeline.start().unwrap();

    assert!(pipeline.stop());
    assert!(!pipeline.stop());
    assert_eq!(pipeline.len(), 0);
}

#[test]
fn test_start_twice_leaves_running_pipeline_untouched() {
    init_tracing();
    let (wait, done) = empty_queues();
    let mut pipeline = Pipeline::new(wait, done).with_sink(discard_sink());
    pipeline
        .register_thread(TaskFn::function(|x: u64| Ok(x)), 3, None)
        .unwrap();
    pipeline.start().unwrap();

    let err = pipeline.start().unwrap_err();
    assert!(matches!(err, RuntimeError::AlreadyStarted { .. }));
    assert_eq!(pipeline.len(), 3);

    let err = pipeline
        .register_thread(TaskFn::function(|x: u64| Ok(x)), 1, None)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::AlreadyStarted { .. }));
    assert_eq!(pipeline.tracker().len(), 1);
    assert_eq!(
        format!("{pipeline:?}"),
        "Pipeline { stages: 1, workers: 3, running: true, .. }"
    );

    pipeline.stop();
}

#[test]
fn test_stop_mid_stream_keeps_every_item_then_resumes() {
    init_tracing();
    const N: u64 = 100;
    let (wait, done) = empty_queues();
    for i in 0..N {
        wait.put(Envelope::Item(i), false, None).unwrap();
    }
    let config = PipelineConfig::default().with_log_interval(Duration::from_millis(5));
    let mut pipeline = Pipeline::with_config(wait.clone(), done.clone(), config).with_sink(discard_sink());
    pipeline
        .register_thread(
            TaskFn::function(|x: u64| {
                std::thread::sleep(Duration::from_millis(2));
                Ok(x)
            }),
            2,
            Some("slow"),
        )
        .unwrap()
        .register_coroutine(
            TaskFn::future(|x: u64| async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(x)
            }),
            4,
            Some("relay"),
        )
        .unwrap();

    pipeline.start().unwrap();
    std::thread::sleep(Duration::from_millis(30));
    pipeline.stop();

    assert!(no_poison(&wait));
    let queued: usize = pipeline
        .tracker()
        .stages()
        .iter()
        .map(|stage| stage.wait_queue().len())
        .sum();
    assert_eq!(queued + done.len(), N as usize);

    pipeline.run().unwrap();

    let mut values: Vec<u64> = done.snapshot().into_iter().filter_map(Envelope::into_value).collect();
    values.sort_unstable();
    assert_eq!(values, (0..N).collect::<Vec<_>>());
}

#[test]
fn test_execute_stops_even_when_progress_sink_panics() {
    init_tracing();
    let (wait, done) = empty_queues();
    wait.put(Envelope::Item(1), false, None).unwrap();
    let mut pipeline = Pipeline::new(wait, done).with_sink(Arc::new(|event: &flowgate::LogEvent<'_>| {
        if let flowgate::LogEvent::Completed = event {
            panic!("sink exploded");
        }
    }));
    pipeline
        .register_thread(TaskFn::function(|x: u64| Ok(x)), 2, None)
        .unwrap();

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pipeline.execute(Duration::from_millis(5))
    }));

    assert!(outcome.is_err());
    assert_eq!(pipeline.len(), 0);
    assert!(!pipeline.is_running());
}
