//! Step trait and error types.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::task::TaskFn;

/// Error returned by a step execution.
#[derive(Error, Debug)]
pub enum StepError {
    /// Transient failure - worth retrying.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure - quarantined even when the pipeline retries.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl StepError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// True if `err` is, or wraps, a [`StepError::Permanent`].
    pub fn is_permanent(err: &anyhow::Error) -> bool {
        err.chain()
            .any(|cause| matches!(cause.downcast_ref::<StepError>(), Some(StepError::Permanent(_))))
    }
}

/// An async unit of work with a stable name.
///
/// Implement this instead of passing a closure when a stage carries state
/// or needs a fixed name.
#[async_trait]
pub trait Step: Send + Sync {
    /// The input type this step accepts.
    type Input: Send;

    /// The output type this step produces.
    type Output: Send;

    /// The name of this step for logging and status lines.
    fn name(&self) -> &'static str;

    /// Execute the step with the given input.
    async fn execute(&self, input: Self::Input) -> Result<Self::Output, StepError>;
}

impl<I, O> TaskFn<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Wrap a [`Step`] as an async-function task named after the step.
    pub fn step<S>(step: S) -> Self
    where
        S: Step<Input = I, Output = O> + 'static,
    {
        let name = step.name();
        let step = Arc::new(step);
        TaskFn::future(move |input: I| {
            let step = step.clone();
            async move { step.execute(input).await.map_err(anyhow::Error::from) }
        })
        .named(name)
    }
}
