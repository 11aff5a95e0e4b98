use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::queue::{Queue, QueueError, SharedQueue};
use crate::runtime::{CoroutineTaskManager, RuntimeError, RuntimeTaskManager, ThreadTaskManager};
use crate::sink::{tracing_sink, LogEvent, LogSink};
use crate::task::TaskFn;

use super::progress::ProgressReport;
use super::stage::{Envelope, Settle, StageStatus};
use super::tracker::Tracker;

/// Pause before re-checking a liveness predicate that just turned true.
const DONE_CONFIRMATION: Duration = Duration::from_millis(10);

/// Which manager runs a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerKind {
    Thread,
    Coroutine,
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    kind: ManagerKind,
    worker: usize,
}

/// Stages over runtime task managers, with progress reporting and a
/// poison-pill shutdown.
///
/// Register stages, then `start` (or `execute`). `stop` always returns once
/// every stage manager stopped, even when thread workers sit blocked on an
/// empty wait queue.
pub struct Pipeline<T: Send + 'static> {
    tracker: Tracker<T>,
    config: PipelineConfig,
    sink: LogSink,
    plan: Vec<Registration>,
    managers: Vec<Box<dyn RuntimeTaskManager>>,
}

impl<T: Clone + Send + Sync + 'static> Pipeline<T> {
    pub fn new(wait: SharedQueue<Envelope<T>>, done: SharedQueue<Envelope<T>>) -> Self {
        Self::with_config(wait, done, PipelineConfig::default())
    }

    pub fn with_config(
        wait: SharedQueue<Envelope<T>>,
        done: SharedQueue<Envelope<T>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            tracker: Tracker::new(wait, done),
            config,
            sink: tracing_sink(),
            plan: Vec::new(),
            managers: Vec::new(),
        }
    }

    /// Send progress lines and task failures to `sink`.
    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    /// Append a stage run by `worker` OS threads. The task must be a
    /// blocking function or generator.
    pub fn register_thread(
        &mut self,
        task: TaskFn<T, T>,
        worker: usize,
        name: Option<&str>,
    ) -> Result<&mut Self, RuntimeError> {
        self.register(ManagerKind::Thread, task, worker, name)
    }

    /// Append a stage run by `worker` cooperative tasks on one host thread.
    /// The task must be an async function or async generator.
    pub fn register_coroutine(
        &mut self,
        task: TaskFn<T, T>,
        worker: usize,
        name: Option<&str>,
    ) -> Result<&mut Self, RuntimeError> {
        self.register(ManagerKind::Coroutine, task, worker, name)
    }

    fn register(
        &mut self,
        kind: ManagerKind,
        task: TaskFn<T, T>,
        worker: usize,
        name: Option<&str>,
    ) -> Result<&mut Self, RuntimeError> {
        if self.is_running() {
            return Err(RuntimeError::AlreadyStarted {
                manager: "pipeline".to_string(),
            });
        }
        let shape = task.shape();
        if shape.is_async() != (kind == ManagerKind::Coroutine) {
            return Err(RuntimeError::UnsupportedShape {
                manager: format!("{kind:?} stage '{}'", name.unwrap_or(task.name())),
                shape,
            });
        }

        let name = name.map_or_else(|| task.name().to_string(), str::to_string);
        debug!(stage = %name, ?kind, worker, "stage registered");
        self.tracker.append_stage(name, task);
        self.plan.push(Registration { kind, worker });
        Ok(self)
    }

    /// Build one manager per stage and start them in stage order.
    ///
    /// If a stage fails to start, the ones already started are stopped
    /// again and the error is returned.
    pub fn start(&mut self) -> Result<(), RuntimeError> {
        if self.is_running() {
            return Err(RuntimeError::AlreadyStarted {
                manager: "pipeline".to_string(),
            });
        }

        let settle = Settle {
            retry: self.config.retry,
            sink: self.sink.clone(),
        };
        let tasks = self
            .tracker
            .stage_tasks(&settle, self.config.runtime.idle_poll);
        self.tracker.reset_clock();

        let plan = self.plan.clone();
        for (task, registration) in tasks.into_iter().zip(plan) {
            let runtime = self.config.runtime.clone();
            let mut manager: Box<dyn RuntimeTaskManager> = match registration.kind {
                ManagerKind::Thread => Box::new(
                    ThreadTaskManager::with_config(task, runtime).with_sink(self.sink.clone()),
                ),
                ManagerKind::Coroutine => Box::new(
                    CoroutineTaskManager::with_config(task, runtime).with_sink(self.sink.clone()),
                ),
            };
            if let Err(e) = manager.start(registration.worker) {
                error!(stage = manager.name(), error = %e, "stage failed to start");
                self.stop();
                return Err(e);
            }
            self.managers.push(manager);
        }

        info!(stages = self.managers.len(), workers = self.len(), "pipeline started");
        Ok(())
    }

    /// Block until the pipeline drains, handing a progress report to `sink`
    /// every `interval`, then a final report and a completion marker.
    ///
    /// Drained means no stage has anything waiting or in flight, observed
    /// twice in a row.
    pub fn await_progress(&self, interval: Duration, sink: &LogSink) {
        loop {
            if self.tracker.is_done() {
                thread::sleep(DONE_CONFIRMATION);
                if self.tracker.is_done() {
                    break;
                }
                continue;
            }
            sink(&LogEvent::Progress(&self.tracker.report()));
            thread::sleep(interval);
        }
        sink(&LogEvent::Progress(&self.tracker.report()));
        sink(&LogEvent::Completed);
    }

    /// Start, wait until drained while reporting progress, then stop. Stop
    /// also runs if waiting panics.
    pub fn execute(&mut self, log_interval: Duration) -> Result<(), RuntimeError> {
        self.start()?;
        let running = StopOnDrop(self);
        let sink = running.0.sink.clone();
        running.0.await_progress(log_interval, &sink);
        Ok(())
    }

    /// [`execute`](Self::execute) at the configured log interval.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let interval = self.config.log_interval;
        self.execute(interval)
    }
}

impl<T: Send + 'static> Pipeline<T> {
    /// Stop every stage.
    ///
    /// A broadcaster thread keeps injecting poison into every wait queue
    /// while the managers stop, so workers parked on an empty queue wake up.
    /// Leftover poison is purged afterwards; real items stay queued.
    /// Returns `false` when the pipeline was not running.
    pub fn stop(&mut self) -> bool {
        if self.managers.is_empty() {
            return false;
        }
        info!(stages = self.managers.len(), "pipeline stop triggered");

        let wait_queues: Vec<_> = self
            .tracker
            .stages()
            .iter()
            .map(|stage| stage.wait_queue().clone())
            .collect();
        let halt = Arc::new(AtomicBool::new(false));
        let broadcaster = spawn_broadcaster(wait_queues.clone(), halt.clone(), self.config.poison_period);
        if broadcaster.is_none() {
            // One poison per worker still wakes every parked thread once.
            for (queue, registration) in wait_queues.iter().zip(&self.plan) {
                for _ in 0..registration.worker {
                    let _ = queue.put(Envelope::Poison, false, None);
                }
            }
        }

        for manager in &mut self.managers {
            manager.stop();
        }

        halt.store(true, Ordering::Release);
        if let Some(handle) = broadcaster {
            if handle.join().is_err() {
                error!("poison broadcaster panicked");
            }
        }

        for queue in &wait_queues {
            purge_poison(queue.as_ref());
        }
        self.managers.clear();
        info!("pipeline stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        !self.managers.is_empty()
    }

    /// Live workers across every stage manager.
    pub fn len(&self) -> usize {
        self.managers.iter().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_done(&self) -> bool {
        self.tracker.is_done()
    }

    pub fn progress(&self) -> ProgressReport {
        self.tracker.report()
    }

    pub fn status(&self) -> Vec<StageStatus> {
        self.tracker.status()
    }

    pub fn tracker(&self) -> &Tracker<T> {
        &self.tracker
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

impl<T: Send + 'static> fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.tracker.len())
            .field("workers", &self.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Drop for Pipeline<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct StopOnDrop<'a, T: Send + 'static>(&'a mut Pipeline<T>);

impl<T: Send + 'static> Drop for StopOnDrop<'_, T> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

fn spawn_broadcaster<T: Send + 'static>(
    queues: Vec<SharedQueue<Envelope<T>>>,
    halt: Arc<AtomicBool>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("poison-broadcaster".to_string())
        .spawn(move || {
            while !halt.load(Ordering::Acquire) {
                for queue in &queues {
                    let _ = queue.put(Envelope::Poison, false, None);
                }
                thread::sleep(period);
            }
            debug!("poison broadcaster exiting");
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "failed to spawn poison broadcaster");
            None
        }
    }
}

/// Drop every poison envelope, keeping the order of everything else.
fn purge_poison<T>(queue: &dyn Queue<Envelope<T>>) {
    let mut kept = Vec::new();
    let mut purged = 0usize;
    loop {
        match queue.get(false, None) {
            Ok(Envelope::Poison) => purged += 1,
            Ok(envelope) => kept.push(envelope),
            Err(QueueError::Empty) => break,
            Err(e) => {
                warn!(error = %e, "cannot drain wait queue for poison");
                break;
            }
        }
    }
    for envelope in kept {
        if let Err(rejected) = queue.put(envelope, true, None) {
            error!("lost an item while purging poison: {rejected}");
        }
    }
    debug!(purged, "poison purged");
}
