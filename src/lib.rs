//! # Flowgate
//!
//! Worker pools for blocking and async tasks, and queue pipelines built on
//! top of them.
//!
//! Run any of four task shapes under one start/stop contract, then chain
//! them into stages connected by queues, with retry and a shutdown that
//! never leaves a worker parked on an empty queue.
//!
//! ## Why Flowgate?
//!
//! - **One contract, two concurrency models** - OS threads for blocking code,
//!   a single-threaded tokio scheduler for async code
//! - **Shape fixed up front** - a task is a function, generator, async
//!   function or async generator from the moment it is built
//! - **Safe shutdown** - stop flags plus a poison broadcast unblock every
//!   worker, and no item is lost or duplicated by stopping
//! - **Observable** - progress lines and caught task failures go to a
//!   pluggable sink, `tracing` by default
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowgate::{Envelope, MemoryQueue, Pipeline, PipelineConfig, TaskFn};
//!
//! let mut pipeline = Pipeline::with_config(wait, done, PipelineConfig::retry_on_error(false));
//! pipeline
//!     .register_thread(TaskFn::function(parse), 4, None)?
//!     .register_coroutine(TaskFn::future(fetch), 32, Some("fetch"))?;
//!
//! pipeline.execute(Duration::from_secs(1))?;
//! ```
//!
//! ## Runtime Task Managers
//!
//! A manager loops a single task on `worker` execution units:
//!
//! ```rust,ignore
//! use flowgate::{RuntimeTaskManager, TaskFn, ThreadTaskManager};
//!
//! let mut manager = ThreadTaskManager::new(TaskFn::function(poll_once));
//! let running = manager.execute(4)?;
//! assert_eq!(running.len(), 4);
//! // stopped when `running` drops
//! ```

pub mod config;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod sink;
pub mod step;
pub mod task;

pub use config::{PipelineConfig, RuntimeConfig};
pub use pipeline::{
    Envelope, Failure, ManagerKind, Pipeline, ProgressReport, Stage, StageStatus, Tracker,
};
pub use queue::{
    CountOnlyQueue, MemoryQueue, PutError, Queue, QueueError, QueueScope, SharedQueue,
};
pub use retry::RetryPolicy;
pub use runtime::{
    CoroutineTaskManager, Running, RuntimeError, RuntimeTaskManager, ThreadTaskManager,
};
pub use sink::{discard_sink, tracing_sink, LogEvent, LogSink};
pub use step::{Step, StepError};
pub use task::{Flow, Shape, TaskFn, TaskResult};
