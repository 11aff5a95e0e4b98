use std::fmt;
use std::time::Duration;

use serde::Serialize;

use super::stage::StageStatus;

/// Throughput and queue sizes at one point in time.
///
/// Counts are relative to when the tracker's clock was last reset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub elapsed: Duration,
    /// Items that reached the external done queue.
    pub completed: usize,
    /// Items sitting in the stages' error queues.
    pub errored: usize,
    /// `completed / (completed + errored)`, 0 when both are 0.
    pub success_rate: f64,
    /// Completed items per second.
    pub throughput: f64,
    /// `waiting / throughput`. `None` while nothing completed.
    pub remaining: Option<Duration>,
    /// Size of the external wait queue.
    pub waiting: usize,
    pub stages: Vec<StageStatus>,
}

impl ProgressReport {
    pub(crate) fn compute(
        elapsed: Duration,
        completed: usize,
        waiting: usize,
        stages: Vec<StageStatus>,
    ) -> Self {
        let errored = stages.iter().map(|s| s.error).sum();
        let settled = completed + errored;
        let success_rate = if settled > 0 {
            completed as f64 / settled as f64
        } else {
            0.0
        };
        let seconds = elapsed.as_secs_f64();
        let throughput = if seconds > 0.0 {
            completed as f64 / seconds
        } else {
            0.0
        };
        let remaining = (throughput > 0.0)
            .then(|| Duration::try_from_secs_f64(waiting as f64 / throughput).ok())
            .flatten();

        Self {
            elapsed,
            completed,
            errored,
            success_rate,
            throughput,
            remaining,
            waiting,
            stages,
        }
    }
}

/// `HH:MM:SS`, hours unbounded.
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remain = self
            .remaining
            .map(format_hms)
            .unwrap_or_else(|| "--:--:--".to_string());
        write!(
            f,
            "[{}] remain={} {:.1} iter/sec srate={:.2} wait[{}]",
            format_hms(self.elapsed),
            remain,
            self.throughput,
            self.success_rate,
            self.waiting
        )?;
        for stage in &self.stages {
            write!(f, " > {}({}|{})[{}]", stage.name, stage.work, stage.error, stage.done)?;
        }
        Ok(())
    }
}
