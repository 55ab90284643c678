use super::context::JobContext;
use super::enqueuer::JobEnqueuer;
use super::error::JobError;

/// A job type: how to run one delivery, when to trigger, and what to enqueue
/// when triggered.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one delivery of `payload`.
    async fn consume(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), JobError>;

    /// Six-field cron expression (with seconds) for the trigger, or `None` if
    /// this job is only enqueued explicitly.
    fn default_schedule(&self) -> Option<&str>;

    /// Find due work and enqueue deliveries for it.
    async fn enqueue_triggered(
        &self,
        ctx: &JobContext,
        enqueuer: &dyn JobEnqueuer,
    ) -> Result<(), JobError>;
}
