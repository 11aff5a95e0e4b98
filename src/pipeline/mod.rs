//! Multi-stage pipelines over runtime task managers.
//!
//! A [`Pipeline`] chains stages through queues. Each stage pops an
//! [`Envelope`] from its wait queue, marks it in flight, runs its task and
//! routes every produced value to its done queue (the next stage's wait
//! queue) or a [`Failure`] to its error queue. Each stage runs on its own
//! thread-backed or coroutine-backed manager.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use flowgate::{Envelope, MemoryQueue, Pipeline, Queue, SharedQueue, TaskFn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let wait: SharedQueue<Envelope<u64>> = Arc::new(MemoryQueue::new());
//! let done: SharedQueue<Envelope<u64>> = Arc::new(MemoryQueue::new());
//! for i in 1..=5 {
//!     wait.put(Envelope::Item(i), false, None)?;
//! }
//!
//! let mut pipeline = Pipeline::new(wait, done.clone());
//! pipeline.register_thread(TaskFn::function(|x: u64| Ok(x * x)), 2, Some("square"))?;
//! pipeline.execute(Duration::from_millis(100))?;
//!
//! assert_eq!(done.len(), 5);
//! # Ok(())
//! # }
//! ```

mod orchestrator;
mod progress;
mod stage;
mod tracker;

pub use orchestrator::{ManagerKind, Pipeline};
pub use progress::{format_hms, ProgressReport};
pub use stage::{Envelope, Failure, Stage, StageStatus};
pub use tracker::Tracker;
