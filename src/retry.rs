//! Retry policy configuration.

use serde::{Deserialize, Serialize};

/// What a stage does with an item whose task failed.
///
/// Retrying re-enqueues the item into the stage's own wait queue with no
/// backoff. [`RetryPolicy::Unbounded`] keeps retrying until the task
/// succeeds, so an item that always fails circulates forever and the
/// pipeline never reports done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// No retries - quarantine the item in the stage's error queue.
    #[default]
    None,

    /// Re-enqueue every failed item, however often it has failed.
    Unbounded,

    /// Re-enqueue until an item has failed `max_attempts` times, then
    /// quarantine it.
    Limited {
        /// Maximum number of attempts, counting the first one.
        max_attempts: u32,
    },
}

impl RetryPolicy {
    /// The policy matching a plain retry-on-error switch.
    pub fn from_flag(retry_on_error: bool) -> Self {
        if retry_on_error {
            Self::Unbounded
        } else {
            Self::None
        }
    }

    /// Create a capped policy.
    pub fn limited(max_attempts: u32) -> Self {
        Self::Limited { max_attempts }
    }

    /// Whether an item that has now failed `failures` times (1-indexed)
    /// goes back to the wait queue.
    pub fn should_retry(&self, failures: u32) -> bool {
        match self {
            Self::None => false,
            Self::Unbounded => true,
            Self::Limited { max_attempts } => failures < *max_attempts,
        }
    }

    /// True unless failed items are always quarantined.
    pub fn retries(&self) -> bool {
        !matches!(self, Self::None)
    }
}
