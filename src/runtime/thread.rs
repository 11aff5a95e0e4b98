use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use super::{Readiness, RuntimeError, RuntimeTaskManager};
use crate::config::RuntimeConfig;
use crate::sink::{tracing_sink, LogEvent, LogSink};
use crate::task::{Flow, TaskFn};

/// Runs a blocking task on `worker` dedicated OS threads.
///
/// Each thread loops: call the task, report a failure to the sink, pause
/// for the configured interval, until `stop` raises the stop flag. A task
/// that blocks forever keeps its thread alive; unblocking it is the
/// caller's job (the pipeline does it with poison values).
pub struct ThreadTaskManager<O = ()> {
    task: TaskFn<(), O>,
    config: RuntimeConfig,
    sink: LogSink,
    halt: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl<O> ThreadTaskManager<O>
where
    O: Send + 'static,
{
    pub fn new(task: TaskFn<(), O>) -> Self {
        Self::with_config(task, RuntimeConfig::default())
    }

    pub fn with_config(task: TaskFn<(), O>, config: RuntimeConfig) -> Self {
        Self {
            task,
            config,
            sink: tracing_sink(),
            halt: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    /// Route caught task failures to `sink` instead of `tracing`.
    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    fn spawn_worker(&self, id: usize, ready: &Arc<Readiness>) -> std::io::Result<JoinHandle<()>> {
        let task = self.task.clone();
        let halt = self.halt.clone();
        let sink = self.sink.clone();
        let ready = ready.clone();
        let interval = self.config.interval;
        let origin = format!("{}#{id}", self.task.name());

        thread::Builder::new()
            .name(origin.clone())
            .spawn(move || {
                ready.arrive();
                debug!(worker = %origin, "worker thread running");
                run_loop(&task, &halt, interval, &sink, &origin);
                debug!(worker = %origin, "worker thread exiting");
            })
    }
}

fn run_loop<O: Send + 'static>(
    task: &TaskFn<(), O>,
    halt: &AtomicBool,
    interval: Duration,
    sink: &LogSink,
    origin: &str,
) {
    while !halt.load(Ordering::Acquire) {
        let mut flow = Flow::Continue;
        if let Err(error) = task.call_blocking((), |out| flow = Flow::of(&out)) {
            sink(&LogEvent::TaskFailed {
                origin,
                error: &error,
            });
        }
        if flow == Flow::Poisoned {
            continue;
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
}

impl<O> RuntimeTaskManager for ThreadTaskManager<O>
where
    O: Send + 'static,
{
    fn name(&self) -> &str {
        self.task.name()
    }

    fn start(&mut self, worker: usize) -> Result<(), RuntimeError> {
        if !self.handles.is_empty() {
            return Err(RuntimeError::AlreadyStarted {
                manager: self.to_string(),
            });
        }
        let shape = self.task.shape();
        if shape.is_async() {
            return Err(RuntimeError::UnsupportedShape {
                manager: self.to_string(),
                shape,
            });
        }

        info!(manager = %self, worker, "start triggered");
        self.halt.store(false, Ordering::Release);
        let ready = Arc::new(Readiness::new());

        for id in 0..worker {
            match self.spawn_worker(id, &ready) {
                Ok(handle) => self.handles.push(handle),
                Err(source) => {
                    let manager = self.to_string();
                    self.stop();
                    return Err(RuntimeError::Spawn { manager, source });
                }
            }
        }

        if !ready.wait_for(worker, self.config.ready_timeout) {
            let manager = self.to_string();
            let live = ready.count();
            self.stop();
            return Err(RuntimeError::NotReady {
                manager,
                expected: worker,
                live,
            });
        }

        info!(manager = %self, "started");
        Ok(())
    }

    fn stop(&mut self) -> bool {
        if self.handles.is_empty() || self.halt.load(Ordering::Acquire) {
            return false;
        }

        info!(manager = %self, "stop triggered");
        self.halt.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            let worker = handle.thread().name().unwrap_or("<unnamed>").to_string();
            if handle.join().is_err() {
                error!(worker = %worker, "worker thread panicked");
            }
        }
        self.halt.store(false, Ordering::Release);
        info!(manager = %self, "stopped");
        true
    }

    fn len(&self) -> usize {
        self.handles.len()
    }

    fn is_started(&self) -> bool {
        !self.handles.is_empty()
    }
}

impl<O> fmt::Display for ThreadTaskManager<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ThreadTaskManager] {}({})", self.task.name(), self.handles.len())
    }
}

impl<O> fmt::Debug for ThreadTaskManager<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadTaskManager")
            .field("task", &self.task)
            .field("config", &self.config)
            .field("workers", &self.handles.len())
            .finish()
    }
}

impl<O> Drop for ThreadTaskManager<O> {
    fn drop(&mut self) {
        // Workers left running exit after their current iteration.
        if !self.handles.is_empty() {
            self.halt.store(true, Ordering::Release);
        }
    }
}
