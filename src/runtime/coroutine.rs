use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::runtime::Runtime;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Presence, Readiness, RuntimeError, RuntimeTaskManager};
use crate::config::RuntimeConfig;
use crate::sink::{tracing_sink, LogEvent, LogSink};
use crate::task::{Flow, TaskFn};

/// Runs an async task as `worker` cooperative tasks on one host thread.
///
/// The host thread owns a current-thread tokio runtime. `stop` raises the
/// stop flag and waits up to `join_timeout` for every cooperative task to
/// finish its iteration; tasks still pending after that are cancelled.
pub struct CoroutineTaskManager<O = ()> {
    task: TaskFn<(), O>,
    config: RuntimeConfig,
    sink: LogSink,
    halt: Arc<AtomicBool>,
    live: Arc<Readiness>,
    host: Option<Host>,
}

struct Host {
    thread: JoinHandle<()>,
    finished: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

/// Everything a cooperative worker loop needs, cloned per worker.
struct Worker<O> {
    task: TaskFn<(), O>,
    halt: Arc<AtomicBool>,
    live: Arc<Readiness>,
    sink: LogSink,
    config: RuntimeConfig,
    origin: String,
}

impl<O> CoroutineTaskManager<O>
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
            live: Arc::new(Readiness::new()),
            host: None,
        }
    }

    /// Route caught task failures to `sink` instead of `tracing`.
    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = sink;
        self
    }

    fn worker(&self, id: usize) -> Worker<O> {
        Worker {
            task: self.task.clone(),
            halt: self.halt.clone(),
            live: self.live.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
            origin: format!("{}#{id}", self.task.name()),
        }
    }
}

impl<O> Worker<O>
where
    O: Send + 'static,
{
    async fn run(self) {
        let _presence = Presence::enter(&self.live);
        debug!(worker = %self.origin, "cooperative task running");

        while !self.halt.load(Ordering::Acquire) {
            let mut flow = Flow::Continue;
            let outcome = self
                .task
                .call_async((), |out| flow = Flow::of(&out), Some(self.halt.as_ref()))
                .await;
            if let Err(error) = outcome {
                (self.sink)(&LogEvent::TaskFailed {
                    origin: &self.origin,
                    error: &error,
                });
            }

            match flow {
                Flow::Poisoned => {}
                _ if !self.config.interval.is_zero() => {
                    tokio::time::sleep(self.config.interval).await
                }
                Flow::Idle => {}
                Flow::Continue => tokio::task::yield_now().await,
            }
        }
        debug!(worker = %self.origin, "cooperative task exiting");
    }
}

/// Body of the host thread: run every worker until they all return or the
/// token is cancelled.
fn run_host<O>(runtime: Runtime, workers: Vec<Worker<O>>, cancel: CancellationToken, config: RuntimeConfig)
where
    O: Send + 'static,
{
    runtime.block_on(async move {
        let mut set = JoinSet::new();
        for worker in workers {
            set.spawn(worker.run());
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(pending = set.len(), "cancelling cooperative tasks");
                    set.abort_all();
                    while let Some(joined) = set.join_next().await {
                        if let Err(e) = joined {
                            if e.is_panic() {
                                error!("cooperative task panicked");
                            }
                        }
                    }
                    break;
                }
                joined = set.join_next() => match joined {
                    Some(Err(e)) if e.is_panic() => error!("cooperative task panicked"),
                    Some(_) => {}
                    None => break,
                },
            }
        }
    });
    runtime.shutdown_timeout(config.join_timeout);
}

impl<O> RuntimeTaskManager for CoroutineTaskManager<O>
where
    O: Send + 'static,
{
    fn name(&self) -> &str {
        self.task.name()
    }

    fn start(&mut self, worker: usize) -> Result<(), RuntimeError> {
        if self.host.is_some() {
            return Err(RuntimeError::AlreadyStarted {
                manager: self.to_string(),
            });
        }
        let shape = self.task.shape();
        if !shape.is_async() {
            return Err(RuntimeError::UnsupportedShape {
                manager: self.to_string(),
                shape,
            });
        }

        info!(manager = %self, worker, "start triggered");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| RuntimeError::Scheduler {
                manager: self.to_string(),
                source,
            })?;

        self.halt.store(false, Ordering::Release);
        let workers: Vec<_> = (0..worker).map(|id| self.worker(id)).collect();
        let cancel = CancellationToken::new();
        let (done, finished) = mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("{}-scheduler", self.task.name()))
            .spawn({
                let cancel = cancel.clone();
                let config = self.config.clone();
                move || {
                    run_host(runtime, workers, cancel, config);
                    let _ = done.send(());
                }
            })
            .map_err(|source| RuntimeError::Spawn {
                manager: self.to_string(),
                source,
            })?;

        self.host = Some(Host {
            thread,
            finished,
            cancel,
        });

        if !self.live.wait_for(worker, self.config.ready_timeout) {
            let manager = self.to_string();
            let live = self.live.count();
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
        if self.host.is_none() || self.halt.load(Ordering::Acquire) {
            return false;
        }

        info!(manager = %self, "stop triggered");
        self.halt.store(true, Ordering::Release);

        if let Some(host) = self.host.take() {
            match host.finished.recv_timeout(self.config.join_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        manager = %self,
                        timeout = ?self.config.join_timeout,
                        "cooperative tasks did not finish in time"
                    );
                    host.cancel.cancel();
                }
            }
            if host.thread.join().is_err() {
                error!(manager = %self, "scheduler thread panicked");
            }
        }

        self.halt.store(false, Ordering::Release);
        info!(manager = %self, "stopped");
        true
    }

    fn len(&self) -> usize {
        self.live.count()
    }

    fn is_started(&self) -> bool {
        self.host.is_some()
    }
}

impl<O> fmt::Display for CoroutineTaskManager<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[CoroutineTaskManager] {}({})", self.task.name(), self.live.count())
    }
}

impl<O> fmt::Debug for CoroutineTaskManager<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineTaskManager")
            .field("task", &self.task)
            .field("config", &self.config)
            .field("live", &self.live.count())
            .finish()
    }
}

impl<O> Drop for CoroutineTaskManager<O> {
    fn drop(&mut self) {
        if let Some(host) = self.host.take() {
            self.halt.store(true, Ordering::Release);
            host.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_start_runs_exact_worker_count() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let task: TaskFn<(), ()> = TaskFn::future(move |()| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(())
            }
        })
        .named("tick");
        let mut manager = CoroutineTaskManager::new(task);

        manager.start(4).unwrap();
        assert_eq!(manager.len(), 4);
        assert_eq!(manager.to_string(), "[CoroutineTaskManager] tick(4)");

        assert!(manager.stop());
        assert_eq!(manager.len(), 0);
        assert!(counter.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_rejects_blocking_shape() {
        let task: TaskFn<(), ()> = TaskFn::function(|()| Ok(()));
        let mut manager = CoroutineTaskManager::new(task);
        let err = manager.start(1).unwrap_err();
        assert!(matches!(err, RuntimeError::UnsupportedShape { .. }));
        assert!(!manager.is_started());
    }

    #[test]
    fn test_stuck_task_is_cancelled_after_join_timeout() {
        let task: TaskFn<(), ()> = TaskFn::future(|()| async {
            std::future::pending::<()>().await;
            Ok(())
        });
        let config = RuntimeConfig::default().with_join_timeout(Duration::from_millis(50));
        let mut manager = CoroutineTaskManager::with_config(task, config);

        manager.start(2).unwrap();
        assert!(manager.stop());
        assert_eq!(manager.len(), 0);
    }
}
