//! Postgres-backed repository.
//!
//! Expected schema (migrations live outside this crate):
//!
//! ```sql
//! CREATE TABLE accounts (
//!     account_id  BIGINT PRIMARY KEY,
//!     timezone    TEXT   NOT NULL
//! );
//!
//! CREATE TABLE funding_schedules (
//!     funding_schedule_id BIGINT PRIMARY KEY,
//!     account_id          BIGINT      NOT NULL REFERENCES accounts,
//!     bank_account_id     BIGINT      NOT NULL,
//!     name                TEXT        NOT NULL,
//!     rule                TEXT        NOT NULL,
//!     next_occurrence     TIMESTAMPTZ NOT NULL,
//!     last_occurrence     TIMESTAMPTZ
//! );
//!
//! CREATE TABLE spending (
//!     spending_id              BIGINT PRIMARY KEY,
//!     account_id               BIGINT      NOT NULL REFERENCES accounts,
//!     bank_account_id          BIGINT      NOT NULL,
//!     funding_schedule_id      BIGINT      NOT NULL REFERENCES funding_schedules,
//!     name                     TEXT        NOT NULL,
//!     spending_type            TEXT        NOT NULL, -- 'expense' | 'goal'
//!     target_amount            BIGINT      NOT NULL,
//!     current_amount           BIGINT      NOT NULL,
//!     used_amount              BIGINT      NOT NULL,
//!     next_contribution_amount BIGINT      NOT NULL,
//!     is_paused                BOOLEAN     NOT NULL,
//!     recurrence_rule          TEXT,
//!     next_recurrence          TIMESTAMPTZ NOT NULL,
//!     last_recurrence          TIMESTAMPTZ
//! );
//! ```
//!
//! ## Locking
//!
//! `begin` takes `SELECT ... FOR UPDATE` on the account row, so concurrent jobs
//! for the same account queue up behind each other while jobs for different
//! accounts run in parallel.
//!
//! ## Error Mapping
//!
//! | SQLx Error | RepositoryError |
//! |------------|-----------------|
//! | `RowNotFound` | `NotFound` |
//! | anything else | `Storage` (message includes the operation) |

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use fundflow_budgeting::{Account, FundingSchedule, RecurrenceRule, Spending, SpendingType};
use fundflow_core::{AccountId, BankAccountId, FundingScheduleId, SpendingId};

use super::{
    Database, FundingRepository, FundingTransaction, JobRepository, ProcessFundingSchedulesItem,
    RepositoryError,
};

#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }
}

#[async_trait::async_trait]
impl JobRepository for PostgresDatabase {
    #[instrument(skip(self), err)]
    async fn get_funding_schedules_to_process(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessFundingSchedulesItem>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT
                account_id,
                bank_account_id,
                array_agg(funding_schedule_id ORDER BY funding_schedule_id) AS funding_schedule_ids
            FROM funding_schedules
            WHERE next_occurrence <= $1
            GROUP BY account_id, bank_account_id
            ORDER BY account_id, bank_account_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_funding_schedules_to_process", e))?;

        rows.iter()
            .map(|row| -> Result<ProcessFundingSchedulesItem, RepositoryError> {
                let ids: Vec<i64> = row
                    .try_get("funding_schedule_ids")
                    .map_err(|e| map_sqlx_error("get_funding_schedules_to_process", e))?;
                Ok(ProcessFundingSchedulesItem {
                    account_id: AccountId::new(from_db(get(row, "account_id")?)?),
                    bank_account_id: BankAccountId::new(from_db(get(row, "bank_account_id")?)?),
                    funding_schedule_ids: ids
                        .into_iter()
                        .map(|id| from_db(id).map(FundingScheduleId::new))
                        .collect::<Result<_, _>>()?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Database for PostgresDatabase {
    #[instrument(skip(self), err)]
    async fn begin(
        &self,
        account_id: AccountId,
    ) -> Result<Box<dyn FundingTransaction>, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let locked = sqlx::query("SELECT account_id FROM accounts WHERE account_id = $1 FOR UPDATE")
            .bind(to_db(account_id.get())?)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_account", e))?;

        if locked.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(RepositoryError::not_found("account", account_id));
        }

        Ok(Box::new(PostgresTransaction { tx, account_id }))
    }
}

/// Open transaction holding the account row lock.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    account_id: AccountId,
}

#[async_trait::async_trait]
impl FundingRepository for PostgresTransaction {
    #[instrument(skip(self), fields(account_id = %self.account_id), err)]
    async fn get_account(&mut self) -> Result<Account, RepositoryError> {
        let row = sqlx::query("SELECT account_id, timezone FROM accounts WHERE account_id = $1")
            .bind(to_db(self.account_id.get())?)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_account", e))?
            .ok_or_else(|| RepositoryError::not_found("account", self.account_id))?;

        Ok(Account {
            account_id: AccountId::new(from_db(get(&row, "account_id")?)?),
            timezone: get(&row, "timezone")?,
        })
    }

    #[instrument(skip(self), fields(account_id = %self.account_id), err)]
    async fn get_funding_schedule(
        &mut self,
        bank_account_id: BankAccountId,
        funding_schedule_id: FundingScheduleId,
    ) -> Result<FundingSchedule, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT
                funding_schedule_id,
                account_id,
                bank_account_id,
                name,
                rule,
                next_occurrence,
                last_occurrence
            FROM funding_schedules
            WHERE account_id = $1 AND bank_account_id = $2 AND funding_schedule_id = $3
            "#,
        )
        .bind(to_db(self.account_id.get())?)
        .bind(to_db(bank_account_id.get())?)
        .bind(to_db(funding_schedule_id.get())?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_funding_schedule", e))?
        .ok_or_else(|| RepositoryError::not_found("funding schedule", funding_schedule_id))?;

        funding_schedule_from_row(&row)
    }

    #[instrument(skip(self), fields(account_id = %self.account_id), err)]
    async fn update_next_funding_schedule_date(
        &mut self,
        funding_schedule_id: FundingScheduleId,
        next_occurrence: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE funding_schedules
            SET last_occurrence = next_occurrence,
                next_occurrence = $3
            WHERE account_id = $1 AND funding_schedule_id = $2
            "#,
        )
        .bind(to_db(self.account_id.get())?)
        .bind(to_db(funding_schedule_id.get())?)
        .bind(next_occurrence)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_next_funding_schedule_date", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("funding schedule", funding_schedule_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(account_id = %self.account_id), err)]
    async fn get_spending_by_funding_schedule(
        &mut self,
        bank_account_id: BankAccountId,
        funding_schedule_id: FundingScheduleId,
    ) -> Result<Vec<Spending>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT
                spending_id,
                bank_account_id,
                funding_schedule_id,
                name,
                spending_type,
                target_amount,
                current_amount,
                used_amount,
                next_contribution_amount,
                is_paused,
                recurrence_rule,
                next_recurrence,
                last_recurrence
            FROM spending
            WHERE account_id = $1 AND bank_account_id = $2 AND funding_schedule_id = $3
            ORDER BY spending_id ASC
            "#,
        )
        .bind(to_db(self.account_id.get())?)
        .bind(to_db(bank_account_id.get())?)
        .bind(to_db(funding_schedule_id.get())?)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_spending_by_funding_schedule", e))?;

        rows.iter().map(spending_from_row).collect()
    }

    #[instrument(
        skip(self, spending),
        fields(account_id = %self.account_id, count = spending.len()),
        err
    )]
    async fn update_spending(
        &mut self,
        bank_account_id: BankAccountId,
        spending: &[Spending],
    ) -> Result<(), RepositoryError> {
        for item in spending {
            let result = sqlx::query(
                r#"
                UPDATE spending
                SET current_amount = $4,
                    next_contribution_amount = $5,
                    next_recurrence = $6,
                    last_recurrence = $7
                WHERE account_id = $1 AND bank_account_id = $2 AND spending_id = $3
                "#,
            )
            .bind(to_db(self.account_id.get())?)
            .bind(to_db(bank_account_id.get())?)
            .bind(to_db(item.spending_id.get())?)
            .bind(item.current_amount)
            .bind(item.next_contribution_amount)
            .bind(item.next_recurrence)
            .bind(item.last_recurrence)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("update_spending", e))?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::not_found("spending", item.spending_id));
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FundingTransaction for PostgresTransaction {
    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn funding_schedule_from_row(row: &PgRow) -> Result<FundingSchedule, RepositoryError> {
    let rule: String = get(row, "rule")?;
    Ok(FundingSchedule {
        funding_schedule_id: FundingScheduleId::new(from_db(get(row, "funding_schedule_id")?)?),
        account_id: AccountId::new(from_db(get(row, "account_id")?)?),
        bank_account_id: BankAccountId::new(from_db(get(row, "bank_account_id")?)?),
        name: get(row, "name")?,
        rule: parse_rule(&rule)?,
        next_occurrence: get(row, "next_occurrence")?,
        last_occurrence: get(row, "last_occurrence")?,
    })
}

fn spending_from_row(row: &PgRow) -> Result<Spending, RepositoryError> {
    let spending_type = match get::<String>(row, "spending_type")?.as_str() {
        "expense" => SpendingType::Expense,
        "goal" => SpendingType::Goal,
        other => {
            return Err(RepositoryError::Storage(format!(
                "unknown spending_type: {other}"
            )));
        }
    };
    let recurrence_rule = get::<Option<String>>(row, "recurrence_rule")?
        .map(|rule| parse_rule(&rule))
        .transpose()?;

    Ok(Spending {
        spending_id: SpendingId::new(from_db(get(row, "spending_id")?)?),
        bank_account_id: BankAccountId::new(from_db(get(row, "bank_account_id")?)?),
        funding_schedule_id: FundingScheduleId::new(from_db(get(row, "funding_schedule_id")?)?),
        name: get(row, "name")?,
        spending_type,
        target_amount: get(row, "target_amount")?,
        current_amount: get(row, "current_amount")?,
        used_amount: get(row, "used_amount")?,
        next_contribution_amount: get(row, "next_contribution_amount")?,
        is_paused: get(row, "is_paused")?,
        recurrence_rule,
        next_recurrence: get(row, "next_recurrence")?,
        last_recurrence: get(row, "last_recurrence")?,
    })
}

fn get<T>(row: &PgRow, column: &str) -> Result<T, RepositoryError>
where
    T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| RepositoryError::Storage(format!("failed to decode column {column}: {e}")))
}

fn parse_rule(rule: &str) -> Result<RecurrenceRule, RepositoryError> {
    rule.parse()
        .map_err(|e| RepositoryError::Storage(format!("stored rule {rule:?} is invalid: {e}")))
}

fn to_db(id: u64) -> Result<i64, RepositoryError> {
    i64::try_from(id).map_err(|_| RepositoryError::Storage(format!("id {id} exceeds BIGINT range")))
}

fn from_db(id: i64) -> Result<u64, RepositoryError> {
    u64::try_from(id).map_err(|_| RepositoryError::Storage(format!("negative id in database: {id}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound {
            entity: "row",
            id: operation.to_string(),
        },
        sqlx::Error::Database(db_err) => RepositoryError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => RepositoryError::Storage(format!("{operation}: {other}")),
    }
}
