use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use fundflow_core::{BankAccountId, DomainError, DomainResult, FundingScheduleId, SpendingId};

use crate::contribution::calculate_contribution;
use crate::funding_schedule::FundingSchedule;
use crate::recurrence::RecurrenceRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpendingType {
    /// Recurring bill; progress is what is currently set aside.
    Expense,
    /// One-off savings goal; money already spent from it still counts.
    Goal,
}

/// A spending object funded incrementally by a funding schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spending {
    pub spending_id: SpendingId,
    pub bank_account_id: BankAccountId,
    pub funding_schedule_id: FundingScheduleId,
    pub name: String,
    pub spending_type: SpendingType,
    pub target_amount: i64,
    pub current_amount: i64,
    pub used_amount: i64,
    pub next_contribution_amount: i64,
    pub is_paused: bool,
    pub recurrence_rule: Option<RecurrenceRule>,
    /// Deadline the target must be reached by.
    pub next_recurrence: DateTime<Utc>,
    pub last_recurrence: Option<DateTime<Utc>>,
}

/// What one funding event did to a spending object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingOutcome {
    Paused,
    TargetReached,
    Funded {
        contributed: i64,
        next_contribution: i64,
    },
}

impl Spending {
    pub fn progress_amount(&self) -> i64 {
        match self.spending_type {
            SpendingType::Goal => self.current_amount.saturating_add(self.used_amount),
            SpendingType::Expense => self.current_amount,
        }
    }

    pub fn is_target_reached(&self) -> bool {
        self.progress_amount() >= self.target_amount
    }

    /// Applies one funding event of `schedule`, which must already be advanced.
    ///
    /// The contribution scheduled last cycle is treated as deposited (capped at
    /// the remaining amount), then the next contribution is recomputed against
    /// the schedule's new occurrence. Paused or fully funded spending is left
    /// untouched.
    pub fn apply_funding(
        &mut self,
        schedule: &FundingSchedule,
        tz: Tz,
        now: DateTime<Utc>,
    ) -> DomainResult<FundingOutcome> {
        if self.funding_schedule_id != schedule.funding_schedule_id {
            return Err(DomainError::invariant(format!(
                "spending {} belongs to schedule {}, not {}",
                self.spending_id, self.funding_schedule_id, schedule.funding_schedule_id
            )));
        }
        if self.is_paused {
            return Ok(FundingOutcome::Paused);
        }
        if self.is_target_reached() {
            return Ok(FundingOutcome::TargetReached);
        }

        let remaining = self.target_amount - self.progress_amount();
        let contributed = self.next_contribution_amount.clamp(0, remaining);
        self.current_amount += contributed;

        self.advance_deadline(now, tz)?;

        let next_contribution = calculate_contribution(
            self.target_amount,
            self.progress_amount(),
            schedule.next_occurrence,
            &schedule.rule,
            self.next_recurrence,
            tz,
        )?;
        self.next_contribution_amount = next_contribution;

        Ok(FundingOutcome::Funded {
            contributed,
            next_contribution,
        })
    }

    /// Moves a passed deadline to the next occurrence of the spending's own rule.
    fn advance_deadline(&mut self, now: DateTime<Utc>, tz: Tz) -> DomainResult<()> {
        let Some(rule) = &self.recurrence_rule else {
            return Ok(());
        };
        if self.next_recurrence > now {
            return Ok(());
        }

        let next = rule
            .next_after(self.next_recurrence, now, tz)
            .ok_or_else(|| {
                DomainError::invalid_rule(format!(
                    "spending {} rule {rule} has no occurrence after {now}",
                    self.spending_id
                ))
            })?;
        self.last_recurrence = Some(self.next_recurrence);
        self.next_recurrence = next;
        Ok(())
    }
}
