//! In-memory repository for tests/dev.
//!
//! Transactions copy the account's rows on `begin`, work on that copy and
//! write it back on `commit`. A per-account async lock is held for the
//! lifetime of the transaction, so jobs for one account run one at a time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use fundflow_budgeting::{Account, FundingSchedule, Spending};
use fundflow_core::{AccountId, BankAccountId, FundingScheduleId, SpendingId};

use super::{
    Database, FundingRepository, FundingTransaction, JobRepository, ProcessFundingSchedulesItem,
    RepositoryError,
};

/// Operations that can be made to fail once via [`InMemoryStore::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Begin,
    UpdateNextFundingScheduleDate,
    GetSpendingByFundingSchedule,
    UpdateSpending,
    Commit,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    funding_schedules: BTreeMap<FundingScheduleId, FundingSchedule>,
    spending: BTreeMap<SpendingId, Spending>,
}

impl Tables {
    /// Copy of the rows owned by `account_id`.
    fn for_account(&self, account_id: AccountId) -> Tables {
        let funding_schedules: BTreeMap<_, _> = self
            .funding_schedules
            .iter()
            .filter(|(_, s)| s.account_id == account_id)
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        let spending = self
            .spending
            .iter()
            .filter(|(_, s)| funding_schedules.contains_key(&s.funding_schedule_id))
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        let accounts = self
            .accounts
            .get(&account_id)
            .map(|a| (account_id, a.clone()))
            .into_iter()
            .collect();

        Tables {
            accounts,
            funding_schedules,
            spending,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<Tables>,
    account_locks: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
    faults: Mutex<HashMap<FaultPoint, String>>,
}

/// Shared in-memory store. Cloning shares the underlying data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, account: Account) -> Result<(), RepositoryError> {
        self.write()?.accounts.insert(account.account_id, account);
        Ok(())
    }

    pub fn insert_funding_schedule(&self, schedule: FundingSchedule) -> Result<(), RepositoryError> {
        self.write()?
            .funding_schedules
            .insert(schedule.funding_schedule_id, schedule);
        Ok(())
    }

    pub fn insert_spending(&self, spending: Spending) -> Result<(), RepositoryError> {
        self.write()?.spending.insert(spending.spending_id, spending);
        Ok(())
    }

    pub fn funding_schedule(&self, id: FundingScheduleId) -> Option<FundingSchedule> {
        self.read().ok()?.funding_schedules.get(&id).cloned()
    }

    pub fn spending(&self, id: SpendingId) -> Option<Spending> {
        self.read().ok()?.spending.get(&id).cloned()
    }

    /// Make the next call at `point` fail with [`RepositoryError::Injected`].
    pub fn fail_next(&self, point: FaultPoint, message: impl Into<String>) {
        let mut faults = self.inner.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.insert(point, message.into());
    }

    fn take_fault(&self, point: FaultPoint) -> Result<(), RepositoryError> {
        let mut faults = self.inner.faults.lock().unwrap_or_else(|e| e.into_inner());
        match faults.remove(&point) {
            Some(message) => Err(RepositoryError::Injected(message)),
            None => Ok(()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, RepositoryError> {
        self.inner
            .tables
            .read()
            .map_err(|_| RepositoryError::Storage("in-memory tables lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, RepositoryError> {
        self.inner
            .tables
            .write()
            .map_err(|_| RepositoryError::Storage("in-memory tables lock poisoned".into()))
    }

    fn account_lock(&self, account_id: AccountId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .account_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks.entry(account_id).or_default().clone()
    }
}

#[async_trait::async_trait]
impl JobRepository for InMemoryStore {
    async fn get_funding_schedules_to_process(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessFundingSchedulesItem>, RepositoryError> {
        let tables = self.read()?;
        let mut groups: BTreeMap<(AccountId, BankAccountId), Vec<FundingScheduleId>> =
            BTreeMap::new();

        for schedule in tables.funding_schedules.values().filter(|s| s.is_due(now)) {
            groups
                .entry((schedule.account_id, schedule.bank_account_id))
                .or_default()
                .push(schedule.funding_schedule_id);
        }

        Ok(groups
            .into_iter()
            .map(
                |((account_id, bank_account_id), funding_schedule_ids)| ProcessFundingSchedulesItem {
                    account_id,
                    bank_account_id,
                    funding_schedule_ids,
                },
            )
            .collect())
    }
}

#[async_trait::async_trait]
impl Database for InMemoryStore {
    async fn begin(
        &self,
        account_id: AccountId,
    ) -> Result<Box<dyn FundingTransaction>, RepositoryError> {
        let guard = self.account_lock(account_id).lock_owned().await;
        self.take_fault(FaultPoint::Begin)?;
        let staged = self.read()?.for_account(account_id);

        Ok(Box::new(InMemoryTransaction {
            store: self.clone(),
            account_id,
            staged,
            written_schedules: BTreeSet::new(),
            written_spending: BTreeSet::new(),
            _guard: guard,
        }))
    }
}

/// Staged unit of work over an [`InMemoryStore`].
///
/// Commit publishes only the columns the transaction wrote, on the rows it
/// wrote; everything else in the live tables is left as it is.
#[derive(Debug)]
pub struct InMemoryTransaction {
    store: InMemoryStore,
    account_id: AccountId,
    staged: Tables,
    written_schedules: BTreeSet<FundingScheduleId>,
    written_spending: BTreeSet<SpendingId>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait::async_trait]
impl FundingRepository for InMemoryTransaction {
    async fn get_account(&mut self) -> Result<Account, RepositoryError> {
        self.staged
            .accounts
            .get(&self.account_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("account", self.account_id))
    }

    async fn get_funding_schedule(
        &mut self,
        bank_account_id: BankAccountId,
        funding_schedule_id: FundingScheduleId,
    ) -> Result<FundingSchedule, RepositoryError> {
        self.staged
            .funding_schedules
            .get(&funding_schedule_id)
            .filter(|s| s.bank_account_id == bank_account_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("funding schedule", funding_schedule_id))
    }

    async fn update_next_funding_schedule_date(
        &mut self,
        funding_schedule_id: FundingScheduleId,
        next_occurrence: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.store
            .take_fault(FaultPoint::UpdateNextFundingScheduleDate)?;

        let schedule = self
            .staged
            .funding_schedules
            .get_mut(&funding_schedule_id)
            .ok_or_else(|| RepositoryError::not_found("funding schedule", funding_schedule_id))?;
        schedule.last_occurrence = Some(schedule.next_occurrence);
        schedule.next_occurrence = next_occurrence;
        self.written_schedules.insert(funding_schedule_id);
        Ok(())
    }

    async fn get_spending_by_funding_schedule(
        &mut self,
        bank_account_id: BankAccountId,
        funding_schedule_id: FundingScheduleId,
    ) -> Result<Vec<Spending>, RepositoryError> {
        self.store.take_fault(FaultPoint::GetSpendingByFundingSchedule)?;

        Ok(self
            .staged
            .spending
            .values()
            .filter(|s| {
                s.bank_account_id == bank_account_id && s.funding_schedule_id == funding_schedule_id
            })
            .cloned()
            .collect())
    }

    async fn update_spending(
        &mut self,
        bank_account_id: BankAccountId,
        spending: &[Spending],
    ) -> Result<(), RepositoryError> {
        self.store.take_fault(FaultPoint::UpdateSpending)?;

        // Validate the whole batch before touching anything.
        for item in spending {
            match self.staged.spending.get(&item.spending_id) {
                Some(existing) if existing.bank_account_id == bank_account_id => {}
                _ => return Err(RepositoryError::not_found("spending", item.spending_id)),
            }
        }
        for item in spending {
            self.staged.spending.insert(item.spending_id, item.clone());
            self.written_spending.insert(item.spending_id);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FundingTransaction for InMemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let InMemoryTransaction {
            store,
            staged,
            written_schedules,
            written_spending,
            _guard,
            ..
        } = *self;
        store.take_fault(FaultPoint::Commit)?;

        let mut tables = store.write()?;
        for id in written_schedules {
            if let (Some(live), Some(written)) =
                (tables.funding_schedules.get_mut(&id), staged.funding_schedules.get(&id))
            {
                live.next_occurrence = written.next_occurrence;
                live.last_occurrence = written.last_occurrence;
            }
        }
        for id in written_spending {
            if let (Some(live), Some(written)) = (tables.spending.get_mut(&id), staged.spending.get(&id)) {
                live.current_amount = written.current_amount;
                live.next_contribution_amount = written.next_contribution_amount;
                live.next_recurrence = written.next_recurrence;
                live.last_recurrence = written.last_recurrence;
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        Ok(())
    }
}
