//! Queue that only counts.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{PutError, Queue, QueueError};

/// Tracks how many items are "in" the queue without storing them.
///
/// Used as the in-flight marker of a stage, where membership is never
/// inspected. `get` and `snapshot` are unsupported; remove items with
/// [`Queue::discard`].
pub struct CountOnlyQueue<T> {
    count: AtomicUsize,
    _item: PhantomData<fn(T)>,
}

impl<T> CountOnlyQueue<T> {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            _item: PhantomData,
        }
    }
}

impl<T> Default for CountOnlyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> for CountOnlyQueue<T> {
    fn put(&self, _item: T, _block: bool, _timeout: Option<Duration>) -> Result<(), PutError<T>> {
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn get(&self, _block: bool, _timeout: Option<Duration>) -> Result<T, QueueError> {
        Err(QueueError::Unsupported("count-only queue does not retain items"))
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        Vec::new()
    }

    fn clear(&self) {
        self.count.store(0, Ordering::Release);
    }

    fn discard(&self) -> bool {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}
