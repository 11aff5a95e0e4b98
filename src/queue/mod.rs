//! Queue contract shared by every stage of a pipeline.
//!
//! The runtime never owns queue storage. It talks to queues only through
//! [`Queue`], so a caller can plug in any thread-safe FIFO. Two
//! implementations ship with the crate:
//!
//! - [`MemoryQueue`]: an in-memory FIFO with optional capacity.
//! - [`CountOnlyQueue`]: keeps a count and nothing else, used to track
//!   items in flight.

mod count_only;
mod memory;

pub use count_only::CountOnlyQueue;
pub use memory::MemoryQueue;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error type for queue operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Nothing to take: non-blocking `get` on an empty queue, or the timeout
    /// elapsed before an item arrived.
    #[error("queue is empty")]
    Empty,

    /// No room: non-blocking `put` on a full queue, or the timeout elapsed
    /// before space was freed.
    #[error("queue is full")]
    Full,

    /// The queue does not support this operation.
    #[error("unsupported queue operation: {0}")]
    Unsupported(&'static str),
}

/// A rejected `put`. Hands the item back so the caller can retry or drop it.
pub struct PutError<T> {
    pub kind: QueueError,
    pub item: T,
}

impl<T> PutError<T> {
    pub fn new(kind: QueueError, item: T) -> Self {
        Self { kind, item }
    }

    /// Recover the item that could not be inserted.
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutError").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PutError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "put rejected: {}", self.kind)
    }
}

impl<T> std::error::Error for PutError<T> {}

/// A thread-safe FIFO.
///
/// Implementations must tolerate many concurrent producers and consumers.
/// `block = false` never waits; `block = true` with `timeout = None` waits
/// indefinitely.
pub trait Queue<T>: Send + Sync {
    /// Insert an item, waiting for space if the queue is bounded.
    fn put(&self, item: T, block: bool, timeout: Option<Duration>) -> Result<(), PutError<T>>;

    /// Remove and return the oldest item.
    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<T, QueueError>;

    /// Current number of items.
    fn len(&self) -> usize;

    /// Copy of the items currently held, oldest first. Does not drain.
    fn snapshot(&self) -> Vec<T>
    where
        T: Clone;

    /// Remove every item.
    fn clear(&self);

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the oldest item without handing it back.
    ///
    /// Returns `false` when there was nothing to remove. Queues that do not
    /// retain items override this.
    fn discard(&self) -> bool {
        self.get(false, None).is_ok()
    }

    /// Acquire backing resources. No-op by default.
    fn open(&self) -> Result<(), QueueError> {
        Ok(())
    }

    /// Release backing resources. No-op by default.
    fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Shared handle to a queue.
pub type SharedQueue<T> = Arc<dyn Queue<T>>;

/// Scoped `open`/`close` for a queue. Closes on drop.
pub struct QueueScope<T: 'static> {
    queue: SharedQueue<T>,
}

impl<T: 'static> QueueScope<T> {
    pub fn open(queue: SharedQueue<T>) -> Result<Self, QueueError> {
        queue.open()?;
        Ok(Self { queue })
    }

    pub fn queue(&self) -> &SharedQueue<T> {
        &self.queue
    }
}

impl<T: 'static> Drop for QueueScope<T> {
    fn drop(&mut self) {
        if let Err(e) = self.queue.close() {
            tracing::warn!(error = %e, "failed to close queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    /// Memory queue that records `open`/`close` calls.
    struct Recording {
        inner: MemoryQueue<u32>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Queue<u32> for Recording {
        fn put(&self, item: u32, block: bool, timeout: Option<Duration>) -> Result<(), PutError<u32>> {
            self.inner.put(item, block, timeout)
        }

        fn get(&self, block: bool, timeout: Option<Duration>) -> Result<u32, QueueError> {
            self.inner.get(block, timeout)
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn snapshot(&self) -> Vec<u32> {
            self.inner.snapshot()
        }

        fn clear(&self) {
            self.inner.clear()
        }

        fn open(&self) -> Result<(), QueueError> {
            self.calls.lock().push("open");
            Ok(())
        }

        fn close(&self) -> Result<(), QueueError> {
            self.calls.lock().push("close");
            Ok(())
        }
    }

    fn recording() -> (SharedQueue<u32>, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let queue = Recording {
            inner: MemoryQueue::new(),
            calls: calls.clone(),
        };
        (Arc::new(queue), calls)
    }

    #[test]
    fn test_scope_opens_then_closes_on_drop() {
        let (queue, calls) = recording();
        {
            let scope = QueueScope::open(queue).unwrap();
            assert_eq!(*calls.lock(), vec!["open"]);

            scope.queue().put(7, false, None).unwrap();
            assert_eq!(scope.queue().get(false, None).unwrap(), 7);
        }
        assert_eq!(*calls.lock(), vec!["open", "close"]);
    }

    #[test]
    fn test_scope_closes_when_body_panics() {
        let (queue, calls) = recording();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _scope = QueueScope::open(queue).unwrap();
            panic!("stage blew up");
        }));

        assert!(outcome.is_err());
        assert_eq!(*calls.lock(), vec!["open", "close"]);
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let queue: SharedQueue<u32> = Arc::new(MemoryQueue::new());
        let scope = QueueScope::open(queue).unwrap();
        assert!(scope.queue().is_empty());
    }
}
