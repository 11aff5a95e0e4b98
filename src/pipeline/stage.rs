use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::queue::{CountOnlyQueue, MemoryQueue, Queue, SharedQueue};
use crate::retry::RetryPolicy;
use crate::sink::{LogEvent, LogSink};
use crate::step::StepError;
use crate::task::{Flow, TaskFn};

/// A value travelling through the pipeline's content queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope<T> {
    /// A fresh item.
    Item(T),
    /// An item sent back to its stage after `failures` failed attempts.
    Retry { item: T, failures: u32 },
    /// Shutdown marker. Never processed.
    Poison,
}

impl<T> Envelope<T> {
    pub fn is_poison(&self) -> bool {
        matches!(self, Envelope::Poison)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Envelope::Item(item) | Envelope::Retry { item, .. } => Some(item),
            Envelope::Poison => None,
        }
    }

    /// The carried item, or `None` for poison.
    pub fn into_value(self) -> Option<T> {
        self.into_parts().map(|(item, _)| item)
    }

    /// How many times the carried item already failed.
    pub fn failures(&self) -> u32 {
        match self {
            Envelope::Retry { failures, .. } => *failures,
            _ => 0,
        }
    }

    fn into_parts(self) -> Option<(T, u32)> {
        match self {
            Envelope::Item(item) => Some((item, 0)),
            Envelope::Retry { item, failures } => Some((item, failures)),
            Envelope::Poison => None,
        }
    }
}

impl<T> From<T> for Envelope<T> {
    fn from(item: T) -> Self {
        Envelope::Item(item)
    }
}

/// A quarantined item: what failed, where, and why.
#[derive(Debug, Clone)]
pub struct Failure<T> {
    pub item: T,
    pub error: Arc<anyhow::Error>,
    pub stage: String,
    /// Failed attempts, the last one included.
    pub failures: u32,
    pub failed_at: DateTime<Utc>,
}

/// Point-in-time queue sizes of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub name: String,
    pub wait: usize,
    pub work: usize,
    pub done: usize,
    pub error: usize,
    /// Failed items sent back to the wait queue so far.
    pub retried: u64,
}

/// One pipeline stage: a task bound to its wait, work, done and error
/// queues.
///
/// The work queue only counts items in flight. Queue handles are fixed once
/// the pipeline is assembled.
pub struct Stage<T> {
    name: String,
    task: TaskFn<T, T>,
    wait: SharedQueue<Envelope<T>>,
    work: SharedQueue<()>,
    done: SharedQueue<Envelope<T>>,
    error: SharedQueue<Failure<T>>,
    retried: Arc<AtomicU64>,
}

impl<T> Clone for Stage<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            task: self.task.clone(),
            wait: self.wait.clone(),
            work: self.work.clone(),
            done: self.done.clone(),
            error: self.error.clone(),
            retried: self.retried.clone(),
        }
    }
}

impl<T> fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("shape", &self.task.shape())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Stage<T> {
    /// A stage reading `wait` and writing `done`, with a fresh in-flight
    /// counter and a fresh error queue.
    pub fn new(
        name: impl Into<String>,
        task: TaskFn<T, T>,
        wait: SharedQueue<Envelope<T>>,
        done: SharedQueue<Envelope<T>>,
    ) -> Self {
        Self {
            name: name.into(),
            task,
            wait,
            work: Arc::new(CountOnlyQueue::new()),
            done,
            error: Arc::new(MemoryQueue::new()),
            retried: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T> Stage<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self) -> &TaskFn<T, T> {
        &self.task
    }

    pub fn wait_queue(&self) -> &SharedQueue<Envelope<T>> {
        &self.wait
    }

    pub fn work_queue(&self) -> &SharedQueue<()> {
        &self.work
    }

    pub fn done_queue(&self) -> &SharedQueue<Envelope<T>> {
        &self.done
    }

    pub fn error_queue(&self) -> &SharedQueue<Failure<T>> {
        &self.error
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub(crate) fn set_done_queue(&mut self, done: SharedQueue<Envelope<T>>) {
        self.done = done;
    }

    pub fn status(&self) -> StageStatus {
        StageStatus {
            name: self.name.clone(),
            wait: self.wait.len(),
            work: self.work.len(),
            done: self.done.len(),
            error: self.error.len(),
            retried: self.retried(),
        }
    }
}

/// Marks one item in flight for as long as it lives.
struct InFlight<'a> {
    work: &'a dyn Queue<()>,
    marked: bool,
}

impl<'a> InFlight<'a> {
    fn mark(work: &'a dyn Queue<()>) -> Self {
        let marked = work.put((), false, None).is_ok();
        Self { work, marked }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.marked {
            self.work.discard();
        }
    }
}

/// How a stage wrapper treats failures.
#[derive(Clone)]
pub(crate) struct Settle {
    pub(crate) retry: RetryPolicy,
    pub(crate) sink: LogSink,
}

impl<T: Clone + Send + Sync + 'static> Stage<T> {
    /// One blocking iteration of the stage protocol.
    pub(crate) fn run_blocking(&self, settle: &Settle) -> Flow {
        let Ok(envelope) = self.wait.get(true, None) else {
            return Flow::Idle;
        };
        let Some((item, failures)) = envelope.into_parts() else {
            return Flow::Poisoned;
        };

        let _in_flight = InFlight::mark(self.work.as_ref());
        let outcome = self.task.call_blocking(item.clone(), |value| self.forward(value));
        if let Err(error) = outcome {
            self.fail(item, failures.saturating_add(1), error, settle);
        }
        Flow::Continue
    }

    /// One cooperative iteration of the stage protocol. Never blocks on the
    /// wait queue: an empty queue sleeps `idle_poll` and reports idle.
    pub(crate) async fn run_async(&self, settle: &Settle, idle_poll: Duration) -> Flow {
        let envelope = match self.wait.get(false, None) {
            Ok(envelope) => envelope,
            Err(_) => {
                tokio::time::sleep(idle_poll).await;
                return Flow::Idle;
            }
        };
        let Some((item, failures)) = envelope.into_parts() else {
            return Flow::Poisoned;
        };

        let _in_flight = InFlight::mark(self.work.as_ref());
        let outcome = self
            .task
            .call_async(item.clone(), |value| self.forward(value), None)
            .await;
        if let Err(error) = outcome {
            self.fail(item, failures.saturating_add(1), error, settle);
        }
        Flow::Continue
    }

    fn forward(&self, value: T) {
        if let Err(rejected) = self.done.put(Envelope::Item(value), true, None) {
            warn!(stage = %self.name, "done queue rejected a result: {rejected}");
        }
    }

    fn fail(&self, item: T, failures: u32, error: anyhow::Error, settle: &Settle) {
        (settle.sink)(&LogEvent::TaskFailed {
            origin: &self.name,
            error: &error,
        });

        let item = if settle.retry.should_retry(failures) && !StepError::is_permanent(&error) {
            match self.wait.put(Envelope::Retry { item, failures }, true, None) {
                Ok(()) => {
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(rejected) => {
                    warn!(stage = %self.name, "wait queue rejected a retry: {rejected}");
                    match rejected.into_inner().into_value() {
                        Some(item) => item,
                        None => return,
                    }
                }
            }
        } else {
            item
        };

        let failure = Failure {
            item,
            error: Arc::new(error),
            stage: self.name.clone(),
            failures,
            failed_at: Utc::now(),
        };
        if let Err(rejected) = self.error.put(failure, true, None) {
            warn!(stage = %self.name, "error queue rejected a failure record: {rejected}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::discard_sink;
    use anyhow::anyhow;

    fn stage_with(task: TaskFn<u64, u64>) -> Stage<u64> {
        Stage::new(
            "s",
            task,
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryQueue::new()),
        )
    }

    fn settle(retry: RetryPolicy) -> Settle {
        Settle {
            retry,
            sink: discard_sink(),
        }
    }

    #[test]
    fn test_poison_is_not_marked_in_flight() {
        let stage = stage_with(TaskFn::function(|x: u64| Ok(x)));
        stage.wait_queue().put(Envelope::Poison, false, None).unwrap();

        assert_eq!(stage.run_blocking(&settle(RetryPolicy::None)), Flow::Poisoned);
        assert_eq!(stage.work_queue().len(), 0);
        assert_eq!(stage.done_queue().len(), 0);
    }

    #[test]
    fn test_success_forwards_every_value() {
        let stage = stage_with(TaskFn::generator(|x: u64| vec![Ok(x), Ok(x + 1)]));
        stage.wait_queue().put(Envelope::Item(10), false, None).unwrap();

        assert_eq!(stage.run_blocking(&settle(RetryPolicy::None)), Flow::Continue);
        assert_eq!(
            stage.done_queue().snapshot(),
            vec![Envelope::Item(10), Envelope::Item(11)]
        );
        assert_eq!(stage.work_queue().len(), 0);
    }

    #[test]
    fn test_failure_is_quarantined_without_retry() {
        let stage = stage_with(TaskFn::function(|_: u64| Err(anyhow!("bad"))));
        stage.wait_queue().put(Envelope::Item(7), false, None).unwrap();

        stage.run_blocking(&settle(RetryPolicy::None));

        let failure = stage.error_queue().get(false, None).unwrap();
        assert_eq!(failure.item, 7);
        assert_eq!(failure.failures, 1);
        assert_eq!(failure.stage, "s");
        assert_eq!(stage.work_queue().len(), 0);
        assert!(stage.wait_queue().is_empty());
    }

    #[test]
    fn test_limited_retry_then_quarantine() {
        let stage = stage_with(TaskFn::function(|_: u64| Err(anyhow!("bad"))));
        stage.wait_queue().put(Envelope::Item(3), false, None).unwrap();
        let settle = settle(RetryPolicy::limited(2));

        stage.run_blocking(&settle);
        assert_eq!(
            stage.wait_queue().snapshot(),
            vec![Envelope::Retry {
                item: 3,
                failures: 1
            }]
        );
        assert_eq!(stage.retried(), 1);

        stage.run_blocking(&settle);
        assert!(stage.wait_queue().is_empty());
        assert_eq!(stage.error_queue().get(false, None).unwrap().failures, 2);
    }

    #[test]
    fn test_permanent_error_skips_retry() {
        let stage = stage_with(TaskFn::function(|_: u64| {
            Err(StepError::permanent(anyhow!("malformed")).into())
        }));
        stage.wait_queue().put(Envelope::Item(1), false, None).unwrap();

        stage.run_blocking(&settle(RetryPolicy::Unbounded));

        assert!(stage.wait_queue().is_empty());
        assert_eq!(stage.error_queue().len(), 1);
        assert_eq!(stage.retried(), 0);
    }

    #[tokio::test]
    async fn test_async_iteration_idles_on_empty_queue() {
        let stage = stage_with(TaskFn::future(|x: u64| async move { Ok(x * 2) }));
        let settle = settle(RetryPolicy::None);

        assert_eq!(stage.run_async(&settle, Duration::from_millis(1)).await, Flow::Idle);

        stage.wait_queue().put(Envelope::Item(4), false, None).unwrap();
        assert_eq!(stage.run_async(&settle, Duration::from_millis(1)).await, Flow::Continue);
        assert_eq!(stage.done_queue().snapshot(), vec![Envelope::Item(8)]);
    }

    #[test]
    fn test_envelope_accessors() {
        let retry = Envelope::Retry {
            item: "a",
            failures: 2,
        };
        assert_eq!(retry.failures(), 2);
        assert_eq!(retry.value(), Some(&"a"));
        assert!(Envelope::<u8>::Poison.is_poison());
        assert_eq!(Envelope::from(5).into_value(), Some(5));
    }
}
