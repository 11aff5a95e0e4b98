//! Counting latch used to know when workers are live.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Counts checked-in workers and lets a starter wait for a target count.
#[derive(Default)]
pub(crate) struct Readiness {
    count: Mutex<usize>,
    changed: Condvar,
}

impl Readiness {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arrive(&self) {
        *self.count.lock() += 1;
        self.changed.notify_all();
    }

    pub(crate) fn depart(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        drop(count);
        self.changed.notify_all();
    }

    pub(crate) fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until at least `target` workers checked in. `false` on timeout.
    pub(crate) fn wait_for(&self, target: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count < target {
            if self.changed.wait_until(&mut count, deadline).timed_out() {
                return *count >= target;
            }
        }
        true
    }
}

/// Checks a worker in for as long as it lives, including when its task is
/// aborted.
pub(crate) struct Presence(Arc<Readiness>);

impl Presence {
    pub(crate) fn enter(readiness: &Arc<Readiness>) -> Self {
        readiness.arrive();
        Self(readiness.clone())
    }
}

impl Drop for Presence {
    fn drop(&mut self) {
        self.0.depart();
    }
}
