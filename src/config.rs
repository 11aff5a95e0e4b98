//! Runtime and pipeline configuration.
//!
//! Durations are expressed in milliseconds when (de)serialized.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Settings shared by every runtime task manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Pause between two iterations of a worker loop. Zero is a tight loop.
    #[serde(rename = "interval_ms", with = "millis")]
    pub interval: Duration,

    /// How long `start` waits for every worker to check in.
    #[serde(rename = "ready_timeout_ms", with = "millis")]
    pub ready_timeout: Duration,

    /// How long a coroutine manager waits for its host thread to wind down
    /// before cancelling the remaining cooperative tasks.
    #[serde(rename = "join_timeout_ms", with = "millis")]
    pub join_timeout: Duration,

    /// Back-off of a coroutine stage that found its wait queue empty.
    #[serde(rename = "idle_poll_ms", with = "millis")]
    pub idle_poll: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            ready_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(2),
            idle_poll: Duration::from_millis(1),
        }
    }
}

impl RuntimeConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }
}

/// Settings for a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// What stages do with failed items. Failed items are retried
    /// without limit unless set otherwise.
    pub retry: RetryPolicy,

    /// Cadence of progress snapshots.
    #[serde(rename = "log_interval_ms", with = "millis")]
    pub log_interval: Duration,

    /// Period at which the shutdown broadcaster re-injects poison.
    #[serde(rename = "poison_period_ms", with = "millis")]
    pub poison_period: Duration,

    /// Applied to every stage manager.
    pub runtime: RuntimeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::Unbounded,
            log_interval: Duration::from_secs(1),
            poison_period: Duration::from_millis(1),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Default settings with retry-on-error switched on or off.
    pub fn retry_on_error(retry_on_error: bool) -> Self {
        Self {
            retry: RetryPolicy::from_flag(retry_on_error),
            ..Self::default()
        }
    }

    /// Parse a JSON document. Missing keys take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }

    pub fn with_poison_period(mut self, period: Duration) -> Self {
        self.poison_period = period;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
