//! Funding schedule processor.
//!
//! For each schedule in the envelope (in order): advance its occurrence, then
//! fund every spending object attached to it. All spending changes are written
//! in one batch at the end. Any error fails the whole unit of work; the caller
//! rolls it back.

use std::sync::Arc;

use tracing::{debug, error, info, trace};

use fundflow_budgeting::FundingOutcome;
use fundflow_core::{AccountId, Clock, FundingScheduleId, SpendingId};

use super::arguments::ProcessFundingScheduleArguments;
use crate::jobs::{JobContext, JobError, TransactionalJob};
use crate::repository::FundingTransaction;

/// What one run did. Only meaningful after a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingReport {
    pub processed: Vec<FundingScheduleId>,
    /// Selected for processing although not yet due
    pub skipped_premature: Vec<FundingScheduleId>,
    pub spending_updated: Vec<SpendingId>,
}

pub struct ProcessFundingScheduleJob {
    arguments: ProcessFundingScheduleArguments,
    clock: Arc<dyn Clock>,
    report: ProcessingReport,
}

impl ProcessFundingScheduleJob {
    pub fn new(arguments: ProcessFundingScheduleArguments, clock: Arc<dyn Clock>) -> Self {
        Self {
            arguments,
            clock,
            report: ProcessingReport::default(),
        }
    }

    pub fn report(&self) -> &ProcessingReport {
        &self.report
    }

    pub fn into_report(self) -> ProcessingReport {
        self.report
    }
}

#[async_trait::async_trait]
impl TransactionalJob for ProcessFundingScheduleJob {
    fn account_id(&self) -> AccountId {
        self.arguments.account_id
    }

    async fn run(&mut self, ctx: &JobContext, repo: &mut dyn FundingTransaction) -> Result<(), JobError> {
        let bank_account_id = self.arguments.bank_account_id;
        self.report = ProcessingReport::default();

        let account = repo.get_account().await.inspect_err(|e| {
            error!(error = %e, "could not retrieve account for funding schedule processing");
        })?;
        let timezone = account.timezone().inspect_err(|e| {
            error!(error = %e, timezone = %account.timezone, "could not parse account's timezone");
        })?;
        let now = self.clock.now();

        let mut pending = Vec::new();

        for &funding_schedule_id in &self.arguments.funding_schedule_ids {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }

            let mut schedule = repo
                .get_funding_schedule(bank_account_id, funding_schedule_id)
                .await
                .inspect_err(|e| {
                    error!(
                        funding_schedule_id = %funding_schedule_id,
                        error = %e,
                        "failed to retrieve funding schedule for processing"
                    );
                })?;

            if !schedule.calculate_next_occurrence(now, timezone)? {
                error!(
                    bug = true,
                    funding_schedule_id = %funding_schedule_id,
                    next_occurrence = %schedule.next_occurrence,
                    now = %now,
                    "funding schedule selected for processing does not occur yet, skipping"
                );
                self.report.skipped_premature.push(funding_schedule_id);
                continue;
            }

            repo.update_next_funding_schedule_date(funding_schedule_id, schedule.next_occurrence)
                .await
                .inspect_err(|e| {
                    error!(
                        funding_schedule_id = %funding_schedule_id,
                        error = %e,
                        "failed to set the next occurrence for funding schedule"
                    );
                })?;
            self.report.processed.push(funding_schedule_id);

            let spending = repo
                .get_spending_by_funding_schedule(bank_account_id, funding_schedule_id)
                .await
                .inspect_err(|e| {
                    error!(
                        funding_schedule_id = %funding_schedule_id,
                        error = %e,
                        "failed to retrieve spending for processing"
                    );
                })?;
            if spending.is_empty() {
                debug!(
                    funding_schedule_id = %funding_schedule_id,
                    "no spending objects associated with funding schedule"
                );
                continue;
            }

            for mut item in spending {
                let outcome = item.apply_funding(&schedule, timezone, now).inspect_err(|e| {
                    error!(
                        funding_schedule_id = %funding_schedule_id,
                        spending_id = %item.spending_id,
                        error = %e,
                        "failed to calculate next contribution for spending"
                    );
                })?;

                match outcome {
                    FundingOutcome::Paused => {
                        debug!(spending_id = %item.spending_id, "skipping spending, it is paused");
                    }
                    FundingOutcome::TargetReached => {
                        trace!(spending_id = %item.spending_id, "skipping spending, target amount is already achieved");
                    }
                    FundingOutcome::Funded {
                        contributed,
                        next_contribution,
                    } => {
                        debug!(
                            spending_id = %item.spending_id,
                            contributed,
                            next_contribution,
                            current_amount = item.current_amount,
                            "funded spending"
                        );
                        self.report.spending_updated.push(item.spending_id);
                        pending.push(item);
                    }
                }
            }
        }

        if pending.is_empty() {
            info!("no spending objects to update");
            return Ok(());
        }

        debug!(count = pending.len(), "updating spending objects");
        repo.update_spending(bank_account_id, &pending)
            .await
            .inspect_err(|e| error!(error = %e, "failed to update spending"))?;

        Ok(())
    }
}
