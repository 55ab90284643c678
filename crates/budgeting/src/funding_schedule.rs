use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use fundflow_core::{AccountId, BankAccountId, DomainResult, FundingScheduleId};

use crate::recurrence::{next_occurrence, RecurrenceRule};

/// A recurring rule describing when money becomes available for a bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingSchedule {
    pub funding_schedule_id: FundingScheduleId,
    pub account_id: AccountId,
    pub bank_account_id: BankAccountId,
    pub name: String,
    pub rule: RecurrenceRule,
    pub next_occurrence: DateTime<Utc>,
    pub last_occurrence: Option<DateTime<Utc>>,
}

impl FundingSchedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_occurrence <= now
    }

    /// Advances `next_occurrence` past `now` when the stored one has arrived.
    ///
    /// Returns `false` and leaves the schedule untouched when it is not due yet.
    /// On advance the previous occurrence moves to `last_occurrence`.
    pub fn calculate_next_occurrence(&mut self, now: DateTime<Utc>, tz: Tz) -> DomainResult<bool> {
        let occurrence = next_occurrence(&self.rule, self.next_occurrence, now, tz)?;
        if !occurrence.is_due {
            return Ok(false);
        }

        self.last_occurrence = Some(self.next_occurrence);
        self.next_occurrence = occurrence.next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(next: DateTime<Utc>) -> FundingSchedule {
        FundingSchedule {
            funding_schedule_id: FundingScheduleId::new(7),
            account_id: AccountId::new(1),
            bank_account_id: BankAccountId::new(2),
            name: "Payday".into(),
            rule: "FREQ=MONTHLY;BYMONTHDAY=15,-1".parse().unwrap(),
            next_occurrence: next,
            last_occurrence: None,
        }
    }

    #[test]
    fn advancing_records_last_occurrence() {
        let due = Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 16, 9, 0, 0).unwrap();
        let mut s = schedule(due);

        assert!(s.is_due(now));
        assert!(s.calculate_next_occurrence(now, Tz::UTC).unwrap());
        assert_eq!(s.last_occurrence, Some(due));
        assert_eq!(s.next_occurrence, Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap());
    }

    #[test]
    fn future_schedule_is_left_alone() {
        let next = Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 16, 9, 0, 0).unwrap();
        let mut s = schedule(next);
        let before = s.clone();

        assert!(!s.calculate_next_occurrence(now, Tz::UTC).unwrap());
        assert_eq!(s, before);
    }

    #[test]
    fn serializes_camel_case_with_rule_string() {
        let s = schedule(Utc.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).unwrap());
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["fundingScheduleId"], 7);
        assert_eq!(json["bankAccountId"], 2);
        assert_eq!(json["rule"], "FREQ=MONTHLY;BYMONTHDAY=15,-1");
        assert!(json["lastOccurrence"].is_null());
    }
}
