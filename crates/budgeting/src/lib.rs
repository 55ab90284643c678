//! Budgeting module (funding schedules, spending objects, allocation math).
//!
//! Pure domain logic only: no IO, no async, no persistence concerns.

pub mod account;
pub mod contribution;
pub mod funding_schedule;
pub mod recurrence;
pub mod spending;

pub use account::Account;
pub use contribution::{calculate_contribution, funding_events_until};
pub use funding_schedule::FundingSchedule;
pub use recurrence::{next_occurrence, Occurrence, RecurrenceRule};
pub use spending::{FundingOutcome, Spending, SpendingType};

/// Re-exported so callers resolve timezones with the same type the calculators take.
pub use chrono_tz::Tz;
