//! Repository boundary for the funding engine.
//!
//! ## Design
//!
//! - `JobRepository` is the read side used by the trigger (not transactional)
//! - `FundingRepository` is everything the processor reads and writes
//! - `FundingTransaction` scopes a `FundingRepository` to one account and one
//!   unit of work; it must end in `commit` or `rollback` (dropping it rolls back)
//! - `Database` opens transactions
//!
//! Implementations:
//! - `InMemoryStore` for tests/dev (staged writes, per-account lock, fault injection)
//! - `PostgresDatabase` backed by `sqlx`

pub mod in_memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fundflow_budgeting::{Account, FundingSchedule, Spending};
use fundflow_core::{AccountId, BankAccountId, FundingScheduleId};

pub use in_memory::{FaultPoint, InMemoryStore, InMemoryTransaction};
pub use postgres::{PostgresDatabase, PostgresTransaction};

/// Repository error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("storage error: {0}")]
    Storage(String),
    /// Failure produced on purpose by a test store.
    #[error("injected failure: {0}")]
    Injected(String),
}

impl RepositoryError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Due funding schedules of one bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessFundingSchedulesItem {
    pub account_id: AccountId,
    pub bank_account_id: BankAccountId,
    pub funding_schedule_ids: Vec<FundingScheduleId>,
}

/// Queries used by the trigger.
#[async_trait::async_trait]
pub trait JobRepository: Send + Sync {
    /// Schedules with `next_occurrence <= now`, grouped per (account, bank account).
    async fn get_funding_schedules_to_process(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessFundingSchedulesItem>, RepositoryError>;
}

/// Account-scoped reads and writes used by the funding processor.
#[async_trait::async_trait]
pub trait FundingRepository: Send {
    async fn get_account(&mut self) -> Result<Account, RepositoryError>;

    async fn get_funding_schedule(
        &mut self,
        bank_account_id: BankAccountId,
        funding_schedule_id: FundingScheduleId,
    ) -> Result<FundingSchedule, RepositoryError>;

    /// Sets the next occurrence; the previous one becomes `last_occurrence`.
    async fn update_next_funding_schedule_date(
        &mut self,
        funding_schedule_id: FundingScheduleId,
        next_occurrence: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn get_spending_by_funding_schedule(
        &mut self,
        bank_account_id: BankAccountId,
        funding_schedule_id: FundingScheduleId,
    ) -> Result<Vec<Spending>, RepositoryError>;

    async fn update_spending(
        &mut self,
        bank_account_id: BankAccountId,
        spending: &[Spending],
    ) -> Result<(), RepositoryError>;
}

/// A `FundingRepository` bound to one open unit of work.
#[async_trait::async_trait]
pub trait FundingTransaction: FundingRepository {
    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError>;
}

/// Opens account-scoped transactions.
#[async_trait::async_trait]
pub trait Database: Send + Sync {
    /// Begin a unit of work for `account_id`. No other transaction for the same
    /// account can make progress until this one ends.
    async fn begin(
        &self,
        account_id: AccountId,
    ) -> Result<Box<dyn FundingTransaction>, RepositoryError>;
}
