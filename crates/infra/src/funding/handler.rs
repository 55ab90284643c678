use std::sync::Arc;

use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use fundflow_core::Clock;

use super::arguments::ProcessFundingScheduleArguments;
use super::processor::ProcessFundingScheduleJob;
use super::{DEFAULT_FUNDING_SCHEDULE, PROCESS_FUNDING_SCHEDULES_QUEUE};
use crate::jobs::{JobContext, JobEnqueuer, JobError, JobHandler, codec, enqueue, execute_in_transaction};
use crate::repository::{Database, JobRepository};

/// Handler for the `ProcessFundingSchedules` queue.
///
/// Triggered hourly: finds due schedules, enqueues one job per bank account.
/// Each delivery runs the processor in one transaction for the account.
pub struct ProcessFundingScheduleHandler {
    db: Arc<dyn Database>,
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
}

impl ProcessFundingScheduleHandler {
    pub fn new(db: Arc<dyn Database>, repository: Arc<dyn JobRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { db, repository, clock }
    }
}

#[async_trait::async_trait]
impl JobHandler for ProcessFundingScheduleHandler {
    async fn consume(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), JobError> {
        let arguments: ProcessFundingScheduleArguments = codec::decode(ctx.queue(), payload)
            .inspect_err(|e| error!(error = %e, "failed to decode arguments for funding schedule job"))?;

        let span = info_span!(
            parent: ctx.span(),
            "process_funding_schedules",
            account_id = %arguments.account_id,
            bank_account_id = %arguments.bank_account_id,
            schedules = arguments.funding_schedule_ids.len()
        );

        let mut job = ProcessFundingScheduleJob::new(arguments, self.clock.clone());
        execute_in_transaction(self.db.as_ref(), ctx, &mut job)
            .instrument(span.clone())
            .await?;

        let report = job.into_report();
        span.in_scope(|| {
            info!(
                processed = report.processed.len(),
                skipped = report.skipped_premature.len(),
                spending_updated = report.spending_updated.len(),
                "funding schedules processed"
            );
        });
        Ok(())
    }

    fn default_schedule(&self) -> Option<&str> {
        Some(DEFAULT_FUNDING_SCHEDULE)
    }

    async fn enqueue_triggered(&self, ctx: &JobContext, enqueuer: &dyn JobEnqueuer) -> Result<(), JobError> {
        info!("retrieving funding schedules to process");
        let items = self
            .repository
            .get_funding_schedules_to_process(self.clock.now())
            .await?;

        if items.is_empty() {
            info!("no funding schedules to be processed at this time");
            return Ok(());
        }

        let total = items.len();
        info!(count = total, "preparing to enqueue funding schedules for processing");

        // Best effort: one group failing to enqueue does not stop the others.
        let mut failed = 0usize;
        for item in items {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let arguments = ProcessFundingScheduleArguments::from(item);
            trace!(
                account_id = %arguments.account_id,
                bank_account_id = %arguments.bank_account_id,
                "enqueuing funding schedules for bank account"
            );

            match enqueue(enqueuer, PROCESS_FUNDING_SCHEDULES_QUEUE, &arguments).await {
                Ok(job_id) => debug!(
                    account_id = %arguments.account_id,
                    bank_account_id = %arguments.bank_account_id,
                    job_id = %job_id,
                    "enqueued funding schedules for processing"
                ),
                Err(e) => {
                    failed += 1;
                    warn!(
                        account_id = %arguments.account_id,
                        bank_account_id = %arguments.bank_account_id,
                        error = %e,
                        "failed to enqueue job to process funding schedule"
                    );
                }
            }
        }

        if failed > 0 {
            warn!(failed, total, "some funding schedule groups were not enqueued");
        }
        Ok(())
    }
}
