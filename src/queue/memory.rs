//! In-memory FIFO backed by a mutex-guarded ring buffer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{PutError, Queue, QueueError};

/// Thread-safe in-memory FIFO.
///
/// Unbounded unless built with [`MemoryQueue::bounded`].
pub struct MemoryQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    maxsize: Option<usize>,
}

impl<T> MemoryQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            maxsize: None,
        }
    }

    /// A queue that holds at most `maxsize` items. `0` means unbounded.
    pub fn bounded(maxsize: usize) -> Self {
        Self {
            maxsize: (maxsize > 0).then_some(maxsize),
            ..Self::new()
        }
    }

    pub fn maxsize(&self) -> Option<usize> {
        self.maxsize
    }

    fn is_full(&self, items: &VecDeque<T>) -> bool {
        self.maxsize.is_some_and(|max| items.len() >= max)
    }

    /// Park on `condvar` until `ready` holds or the deadline passes.
    /// Returns `false` on timeout.
    fn wait_until(
        condvar: &Condvar,
        guard: &mut MutexGuard<'_, VecDeque<T>>,
        deadline: Option<Instant>,
        ready: impl Fn(&VecDeque<T>) -> bool,
    ) -> bool {
        while !ready(guard) {
            match deadline {
                Some(deadline) => {
                    if condvar.wait_until(guard, deadline).timed_out() {
                        return ready(guard);
                    }
                }
                None => condvar.wait(guard),
            }
        }
        true
    }
}

impl<T> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Queue<T> for MemoryQueue<T> {
    fn put(&self, item: T, block: bool, timeout: Option<Duration>) -> Result<(), PutError<T>> {
        let mut items = self.items.lock();
        if self.is_full(&items) {
            if !block {
                return Err(PutError::new(QueueError::Full, item));
            }
            let deadline = timeout.map(|t| Instant::now() + t);
            if !Self::wait_until(&self.not_full, &mut items, deadline, |q| !self.is_full(q)) {
                return Err(PutError::new(QueueError::Full, item));
            }
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    fn get(&self, block: bool, timeout: Option<Duration>) -> Result<T, QueueError> {
        let mut items = self.items.lock();
        if items.is_empty() {
            if !block {
                return Err(QueueError::Empty);
            }
            let deadline = timeout.map(|t| Instant::now() + t);
            if !Self::wait_until(&self.not_empty, &mut items, deadline, |q| !q.is_empty()) {
                return Err(QueueError::Empty);
            }
        }
        let item = items.pop_front().ok_or(QueueError::Empty)?;
        drop(items);
        self.not_full.notify_one();
        Ok(item)
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.items.lock().iter().cloned().collect()
    }

    fn clear(&self) {
        self.items.lock().clear();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_put_get_fifo() {
        let q = MemoryQueue::new();
        q.put("apple", true, None).unwrap();
        q.put("banana", true, None).unwrap();

        assert_eq!(q.len(), 2);
        assert_eq!(q.get(true, None).unwrap(), "apple");
        assert_eq!(q.get(true, None).unwrap(), "banana");
        assert!(q.is_empty());
    }

    #[test]
    fn test_clear() {
        let q = MemoryQueue::new();
        q.put('x', true, None).unwrap();
        q.put('y', true, None).unwrap();
        q.clear();
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_snapshot_does_not_drain() {
        let q = MemoryQueue::new();
        q.put("A", true, None).unwrap();
        q.put("B", true, None).unwrap();

        assert_eq!(q.snapshot(), vec!["A", "B"]);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_nonblocking_get_on_empty() {
        let q: MemoryQueue<u32> = MemoryQueue::new();
        assert_eq!(q.get(false, None), Err(QueueError::Empty));
    }

    #[test]
    fn test_get_times_out() {
        let q: MemoryQueue<u32> = MemoryQueue::new();
        let started = Instant::now();
        assert_eq!(
            q.get(true, Some(Duration::from_millis(20))),
            Err(QueueError::Empty)
        );
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_bounded_put_rejects_when_full() {
        let q = MemoryQueue::bounded(1);
        q.put("A", true, None).unwrap();

        let err = q.put("B", false, None).unwrap_err();
        assert_eq!(err.kind, QueueError::Full);
        assert_eq!(err.into_inner(), "B");

        let err = q.put("C", true, Some(Duration::from_millis(10))).unwrap_err();
        assert_eq!(err.kind, QueueError::Full);
    }

    #[test]
    fn test_blocked_get_wakes_on_put() {
        let q = Arc::new(MemoryQueue::new());
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.get(true, None))
        };
        q.put(7, true, None).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(7));
    }

    #[test]
    fn test_blocked_put_wakes_on_get() {
        let q = Arc::new(MemoryQueue::bounded(1));
        q.put(1, true, None).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.put(2, true, None).is_ok())
        };
        assert_eq!(q.get(true, None), Ok(1));
        assert!(producer.join().unwrap());
        assert_eq!(q.get(true, None), Ok(2));
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        let q = Arc::new(MemoryQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        q.put(p * 100 + i, true, None).unwrap();
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = q.clone();
                thread::spawn(move || (0..50).map(|_| q.get(true, None).unwrap()).collect::<Vec<_>>())
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut seen: Vec<i32> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        seen.sort_unstable();

        let mut expected: Vec<i32> = (0..4).flat_map(|p| (0..25).map(move |i| p * 100 + i)).collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
        assert!(q.is_empty());
    }
}
