use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use fundflow_core::Clock;

use super::codec;
use super::error::JobError;
use super::store::JobStore;
use super::types::{Job, JobId, RetryPolicy};

/// Enqueue boundary used by triggers.
#[async_trait::async_trait]
pub trait JobEnqueuer: Send + Sync {
    async fn enqueue_job(&self, queue: &str, payload: serde_json::Value) -> Result<JobId, JobError>;
}

/// Encode `arguments` and enqueue them on `queue`.
pub async fn enqueue<T: Serialize + Sync>(
    enqueuer: &dyn JobEnqueuer,
    queue: &str,
    arguments: &T,
) -> Result<JobId, JobError> {
    let payload = codec::encode(queue, arguments)?;
    enqueuer.enqueue_job(queue, payload).await
}

/// Enqueues into a [`JobStore`] with a shared retry policy.
#[derive(Clone)]
pub struct StoreEnqueuer {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
}

impl StoreEnqueuer {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[async_trait::async_trait]
impl JobEnqueuer for StoreEnqueuer {
    async fn enqueue_job(&self, queue: &str, payload: serde_json::Value) -> Result<JobId, JobError> {
        let job = Job::new(queue, payload, self.clock.now()).with_retry_policy(self.retry_policy.clone());
        let job_id = self.store.enqueue(job).map_err(|e| JobError::Enqueue {
            queue: queue.to_string(),
            message: e.to_string(),
        })?;
        debug!(queue, job_id = %job_id, "job enqueued");
        Ok(job_id)
    }
}
