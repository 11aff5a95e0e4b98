use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::queue::{MemoryQueue, SharedQueue};
use crate::task::{Flow, TaskFn};

use super::progress::ProgressReport;
use super::stage::{Envelope, Settle, Stage, StageStatus};

/// Ordered stages between an external wait queue and an external done
/// queue.
///
/// Appending a stage wires the previous stage's output to a fresh queue
/// that becomes the new stage's input; the last stage always writes to the
/// external done queue.
pub struct Tracker<T> {
    wait: SharedQueue<Envelope<T>>,
    done: SharedQueue<Envelope<T>>,
    stages: Vec<Stage<T>>,
    since: Instant,
    baseline: usize,
}

impl<T: Clone + Send + Sync + 'static> Tracker<T> {
    pub fn new(wait: SharedQueue<Envelope<T>>, done: SharedQueue<Envelope<T>>) -> Self {
        let baseline = done.len();
        Self {
            wait,
            done,
            stages: Vec::new(),
            since: Instant::now(),
            baseline,
        }
    }

    pub fn append_stage(&mut self, name: impl Into<String>, task: TaskFn<T, T>) -> &Stage<T> {
        let wait = match self.stages.last_mut() {
            None => self.wait.clone(),
            Some(previous) => {
                let hand_off: SharedQueue<Envelope<T>> = Arc::new(MemoryQueue::new());
                previous.set_done_queue(hand_off.clone());
                hand_off
            }
        };
        self.stages.push(Stage::new(name, task, wait, self.done.clone()));
        &self.stages[self.stages.len() - 1]
    }

    /// Per-stage callables for the stage managers, in stage order.
    ///
    /// Blocking stages become blocking functions that park on their wait
    /// queue; async stages become async functions that poll it.
    pub(crate) fn stage_tasks(&self, settle: &Settle, idle_poll: Duration) -> Vec<TaskFn<(), Flow>> {
        self.stages
            .iter()
            .map(|stage| {
                let name = stage.name().to_string();
                let stage = Arc::new(stage.clone());
                let settle = settle.clone();
                if stage.task().shape().is_async() {
                    TaskFn::future(move |()| {
                        let stage = stage.clone();
                        let settle = settle.clone();
                        async move { Ok(stage.run_async(&settle, idle_poll).await) }
                    })
                    .named(name)
                } else {
                    TaskFn::function(move |()| Ok(stage.run_blocking(&settle))).named(name)
                }
            })
            .collect()
    }
}

impl<T> Tracker<T> {
    pub fn stages(&self) -> &[Stage<T>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn wait_queue(&self) -> &SharedQueue<Envelope<T>> {
        &self.wait
    }

    pub fn done_queue(&self) -> &SharedQueue<Envelope<T>> {
        &self.done
    }

    /// True when every stage has an empty wait queue and nothing in flight.
    ///
    /// A poll, not an event: an item popped but not yet marked in flight is
    /// briefly invisible.
    pub fn is_done(&self) -> bool {
        self.stages
            .iter()
            .all(|stage| stage.work_queue().is_empty() && stage.wait_queue().is_empty())
    }

    pub fn status(&self) -> Vec<StageStatus> {
        self.stages.iter().map(Stage::status).collect()
    }

    /// Restart the throughput clock and the completed-count baseline.
    pub fn reset_clock(&mut self) {
        self.since = Instant::now();
        self.baseline = self.done.len();
    }

    pub fn report(&self) -> ProgressReport {
        ProgressReport::compute(
            self.since.elapsed(),
            self.done.len().saturating_sub(self.baseline),
            self.wait.len(),
            self.status(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;
    use crate::retry::RetryPolicy;
    use crate::sink::discard_sink;

    fn tracker() -> Tracker<u64> {
        Tracker::new(Arc::new(MemoryQueue::new()), Arc::new(MemoryQueue::new()))
    }

    #[test]
    fn test_append_stage_wires_queues() {
        let mut tracker = tracker();
        tracker.append_stage("a", TaskFn::function(|x: u64| Ok(x + 1)));
        tracker.append_stage("b", TaskFn::function(|x: u64| Ok(x * 2)));
        tracker.append_stage("c", TaskFn::function(|x: u64| Ok(x)));

        let [a, b, c] = tracker.stages() else {
            panic!("expected three stages");
        };
        assert!(Arc::ptr_eq(a.wait_queue(), tracker.wait_queue()));
        assert!(Arc::ptr_eq(a.done_queue(), b.wait_queue()));
        assert!(Arc::ptr_eq(b.done_queue(), c.wait_queue()));
        assert!(Arc::ptr_eq(c.done_queue(), tracker.done_queue()));
        assert!(!Arc::ptr_eq(a.error_queue(), b.error_queue()));
    }

    #[test]
    fn test_stage_tasks_carry_protocol() {
        let mut tracker = tracker();
        tracker.append_stage("inc", TaskFn::function(|x: u64| Ok(x + 1)));
        tracker.append_stage("double", TaskFn::function(|x: u64| Ok(x * 2)));
        tracker.wait_queue().put(Envelope::Item(4), false, None).unwrap();
        assert!(!tracker.is_done());

        let settle = Settle {
            retry: RetryPolicy::None,
            sink: discard_sink(),
        };
        let tasks = tracker.stage_tasks(&settle, Duration::from_millis(1));
        assert_eq!(tasks[0].name(), "inc");

        for task in &tasks {
            task.call_blocking((), |flow| assert_eq!(flow, Flow::Continue)).unwrap();
        }

        assert!(tracker.is_done());
        assert_eq!(tracker.done_queue().snapshot(), vec![Envelope::Item(10)]);

        let report = tracker.report();
        assert_eq!(report.completed, 1);
        assert_eq!(report.waiting, 0);
        assert_eq!(report.stages.len(), 2);
    }

    #[test]
    fn test_reset_clock_moves_baseline() {
        let mut tracker = tracker();
        tracker.append_stage("id", TaskFn::function(|x: u64| Ok(x)));
        tracker.done_queue().put(Envelope::Item(1), false, None).unwrap();
        assert_eq!(tracker.report().completed, 1);

        tracker.reset_clock();
        assert_eq!(tracker.report().completed, 0);
    }
}
