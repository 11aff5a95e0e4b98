//! Pluggable logging sink for progress lines and caught task failures.

use std::sync::Arc;

use tracing::{error, info};

use crate::pipeline::ProgressReport;

/// Something worth telling the operator about.
#[derive(Debug)]
pub enum LogEvent<'a> {
    /// A periodic throughput/status snapshot.
    Progress(&'a ProgressReport),
    /// A task failed and the failure was contained. `origin` names the
    /// manager or stage that caught it.
    TaskFailed {
        origin: &'a str,
        error: &'a anyhow::Error,
    },
    /// The progress reporter saw the pipeline drain.
    Completed,
}

/// Single-argument sink receiving every [`LogEvent`].
pub type LogSink = Arc<dyn Fn(&LogEvent<'_>) + Send + Sync>;

/// The default sink: forwards events to `tracing`.
pub fn tracing_sink() -> LogSink {
    Arc::new(|event: &LogEvent<'_>| match event {
        LogEvent::Progress(report) => info!(target: "flowgate::progress", "{report}"),
        LogEvent::TaskFailed { origin, error } => {
            error!(origin = *origin, "task failed: {error:#}")
        }
        LogEvent::Completed => info!(target: "flowgate::progress", "DONE !!!"),
    })
}

/// A sink that drops everything.
pub fn discard_sink() -> LogSink {
    Arc::new(|_: &LogEvent<'_>| {})
}
