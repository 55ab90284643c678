//! Routing deliveries to handlers, and the transactional execution scope.

use std::sync::Arc;

use tracing::{Instrument, warn};

use fundflow_core::AccountId;

use super::context::JobContext;
use super::error::JobError;
use super::registry::HandlerRegistry;
use crate::repository::{Database, FundingTransaction};

/// Looks up the handler for a queue and runs the delivery under the context's
/// cancellation token.
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    registry: Arc<HandlerRegistry>,
}

impl JobDispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub async fn dispatch(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), JobError> {
        let handler = self
            .registry
            .get(ctx.queue())
            .ok_or_else(|| JobError::HandlerNotFound(ctx.queue().to_string()))?;

        let consume = handler.consume(ctx, payload).instrument(ctx.span().clone());
        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(JobError::Cancelled),
            result = consume => result,
        }
    }
}

/// Work that runs inside one account-scoped transaction.
#[async_trait::async_trait]
pub trait TransactionalJob: Send {
    fn account_id(&self) -> AccountId;

    async fn run(&mut self, ctx: &JobContext, repo: &mut dyn FundingTransaction) -> Result<(), JobError>;
}

/// Open a transaction for `job`'s account, run the job in it, then commit on
/// success or roll back on error or cancellation.
///
/// Every exit path ends the transaction; a dropped future releases it as a
/// rollback.
pub async fn execute_in_transaction<J>(
    db: &dyn Database,
    ctx: &JobContext,
    job: &mut J,
) -> Result<(), JobError>
where
    J: TransactionalJob + ?Sized,
{
    let cancel = ctx.cancellation();
    let mut tx = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(JobError::Cancelled),
        tx = db.begin(job.account_id()) => tx?,
    };

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(JobError::Cancelled),
        result = job.run(ctx, tx.as_mut()) => result,
    };

    match result {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "failed to roll back transaction");
            }
            Err(err)
        }
    }
}
