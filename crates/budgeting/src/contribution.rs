//! Contribution calculator.
//!
//! Amounts are integer minor units. The per-event contribution is the floor of
//! `remaining / events`; the final event before the deadline receives whatever
//! is left, so repeated cycles land exactly on the target.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use fundflow_core::{DomainError, DomainResult};

use crate::recurrence::RecurrenceRule;

/// Funding events from `next_funding` through `deadline`, inclusive.
///
/// The deadline is capped by the rule's `UNTIL`. Returns 0 when the deadline
/// precedes the next funding event.
pub fn funding_events_until(
    rule: &RecurrenceRule,
    next_funding: DateTime<Utc>,
    deadline: DateTime<Utc>,
    tz: Tz,
) -> u32 {
    let deadline = match rule.until(tz) {
        Some(until) if until < deadline => until,
        _ => deadline,
    };
    rule.count_between(next_funding, deadline, tz)
}

/// Amount to set aside at the next funding event so that `progress` reaches
/// `target` by `deadline`.
///
/// Never negative, zero once the target is met. With a single event left (or
/// none, when the deadline already passed) the whole remainder is due.
pub fn calculate_contribution(
    target: i64,
    progress: i64,
    next_funding: DateTime<Utc>,
    funding_rule: &RecurrenceRule,
    deadline: DateTime<Utc>,
    tz: Tz,
) -> DomainResult<i64> {
    if target < 0 {
        return Err(DomainError::validation(format!(
            "target amount must not be negative, got {target}"
        )));
    }

    let remaining = target.saturating_sub(progress);
    if remaining <= 0 {
        return Ok(0);
    }

    let events = funding_events_until(funding_rule, next_funding, deadline, tz).max(1);
    if events == 1 {
        return Ok(remaining);
    }

    Ok(remaining / i64::from(events))
}
