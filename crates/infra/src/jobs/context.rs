use tokio_util::sync::CancellationToken;
use tracing::Span;

use super::types::Job;

/// Per-delivery execution context.
///
/// Carries the cancellation token every blocking call must observe, plus the
/// tracing span the delivery logs under.
#[derive(Debug, Clone)]
pub struct JobContext {
    queue: String,
    cancel: CancellationToken,
    span: Span,
}

impl JobContext {
    /// Context for work not tied to a stored job (trigger runs, direct calls).
    pub fn new(queue: impl Into<String>, cancel: CancellationToken) -> Self {
        let queue = queue.into();
        let span = tracing::info_span!("job", queue = %queue);
        Self {
            queue,
            cancel,
            span,
        }
    }

    pub fn for_job(job: &Job, cancel: CancellationToken) -> Self {
        let span = tracing::info_span!(
            "job",
            queue = %job.queue,
            job_id = %job.id,
            attempt = job.attempt
        );
        Self {
            queue: job.queue.clone(),
            cancel,
            span,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
