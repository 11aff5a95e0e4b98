//! Runtime task managers: controllable pools of workers looping one task.
//!
//! Two variants share the [`RuntimeTaskManager`] contract:
//!
//! - [`ThreadTaskManager`] runs one OS thread per worker, for blocking
//!   functions and generators.
//! - [`CoroutineTaskManager`] runs one OS thread hosting a single-threaded
//!   tokio scheduler, with `worker` cooperative tasks multiplexed on it, for
//!   async functions and async generators. CPU-bound work inside those tasks
//!   serializes on the host thread; use it for I/O-bound concurrency.
//!
//! A manager is either fully stopped (no live workers, restartable) or fully
//! started (exactly `worker` live workers). `start` only returns once every
//! worker has checked in.

mod coroutine;
mod readiness;
mod thread;

pub use coroutine::CoroutineTaskManager;
pub use thread::ThreadTaskManager;

pub(crate) use readiness::{Presence, Readiness};

use std::ops::{Deref, DerefMut};

use thiserror::Error;

use crate::task::Shape;

/// Misuse and setup failures of a runtime task manager.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// `start` was called while workers are live.
    #[error("{manager} already started")]
    AlreadyStarted { manager: String },

    /// The task shape does not fit the manager kind.
    #[error("{manager} cannot run a {shape} task")]
    UnsupportedShape { manager: String, shape: Shape },

    /// The OS refused to spawn a worker thread.
    #[error("{manager} failed to spawn a thread: {source}")]
    Spawn {
        manager: String,
        #[source]
        source: std::io::Error,
    },

    /// The cooperative scheduler could not be built.
    #[error("{manager} failed to build its scheduler: {source}")]
    Scheduler {
        manager: String,
        #[source]
        source: std::io::Error,
    },

    /// Not every worker checked in before the readiness timeout.
    #[error("{manager}: only {live} of {expected} workers became ready")]
    NotReady {
        manager: String,
        expected: usize,
        live: usize,
    },
}

/// Start/stop contract shared by both manager kinds.
pub trait RuntimeTaskManager: Send {
    /// Name of the task this manager runs.
    fn name(&self) -> &str;

    /// Spawn `worker` execution units and wait until all of them run.
    ///
    /// Fails with [`RuntimeError::AlreadyStarted`] while workers are live,
    /// leaving them untouched, and with [`RuntimeError::UnsupportedShape`]
    /// when the task shape does not fit the manager.
    fn start(&mut self, worker: usize) -> Result<(), RuntimeError>;

    /// Ask every worker to finish its current iteration, wait for all of
    /// them and reset so the manager can start again.
    ///
    /// Returns `false`, doing nothing, when the manager is not running.
    fn stop(&mut self) -> bool;

    /// Number of live workers.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `start` has succeeded and `stop` has not been called since.
    fn is_started(&self) -> bool;

    /// Start now and stop when the returned guard drops, including during
    /// unwinding.
    fn execute(&mut self, worker: usize) -> Result<Running<'_, Self>, RuntimeError>
    where
        Self: Sized,
    {
        Running::start(self, worker)
    }
}

impl RuntimeTaskManager for Box<dyn RuntimeTaskManager> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn start(&mut self, worker: usize) -> Result<(), RuntimeError> {
        (**self).start(worker)
    }

    fn stop(&mut self) -> bool {
        (**self).stop()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn is_started(&self) -> bool {
        (**self).is_started()
    }
}

/// Scoped execution of a manager. Stops it on drop.
pub struct Running<'a, M: RuntimeTaskManager + ?Sized> {
    manager: &'a mut M,
}

impl<'a, M: RuntimeTaskManager + ?Sized> Running<'a, M> {
    pub fn start(manager: &'a mut M, worker: usize) -> Result<Self, RuntimeError> {
        manager.start(worker)?;
        Ok(Self { manager })
    }
}

impl<M: RuntimeTaskManager + ?Sized> Deref for Running<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.manager
    }
}

impl<M: RuntimeTaskManager + ?Sized> DerefMut for Running<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.manager
    }
}

impl<M: RuntimeTaskManager + ?Sized> Drop for Running<'_, M> {
    fn drop(&mut self) {
        self.manager.stop();
    }
}
