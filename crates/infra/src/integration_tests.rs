//! End-to-end tests for the funding pipeline.
//!
//! Trigger → JobStore → JobExecutor → Dispatcher → Processor → Repository
//!
//! Verifies:
//! - Due schedules are fanned out one job per bank account
//! - Processing advances schedules and funds spending in one transaction
//! - Failed jobs leave no partial writes and are retried
//! - Undeliverable payloads go to the dead-letter queue

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use tokio_util::sync::CancellationToken;

    use fundflow_budgeting::{Account, FundingSchedule, Spending, SpendingType};
    use fundflow_core::{AccountId, BankAccountId, FixedClock, FundingScheduleId, SpendingId};

    use crate::funding::{
        PROCESS_FUNDING_SCHEDULES_QUEUE, ProcessFundingScheduleArguments, ProcessFundingScheduleHandler,
    };
    use crate::jobs::{
        HandlerRegistry, InMemoryJobStore, JobDispatcher, JobError, JobExecutor, JobOutcome, JobScheduler,
        JobStatus, JobStore, RetryPolicy, StoreEnqueuer, enqueue,
    };
    use crate::repository::{FaultPoint, InMemoryStore, RepositoryError};

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    struct Harness {
        store: InMemoryStore,
        jobs: Arc<InMemoryJobStore>,
        clock: Arc<FixedClock>,
        enqueuer: StoreEnqueuer,
        scheduler: JobScheduler,
        executor: JobExecutor,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new(now: DateTime<Utc>) -> Self {
            let store = InMemoryStore::new();
            let jobs = Arc::new(InMemoryJobStore::new());
            let clock = Arc::new(FixedClock::new(now));

            let mut registry = HandlerRegistry::new();
            registry
                .register(
                    PROCESS_FUNDING_SCHEDULES_QUEUE,
                    Arc::new(ProcessFundingScheduleHandler::new(
                        Arc::new(store.clone()),
                        Arc::new(store.clone()),
                        clock.clone(),
                    )),
                )
                .unwrap();
            let registry = Arc::new(registry);

            let enqueuer = StoreEnqueuer::new(jobs.clone(), clock.clone())
                .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(60)));
            let scheduler = JobScheduler::new(registry.clone(), Arc::new(enqueuer.clone()), clock.clone());
            let executor = JobExecutor::new(jobs.clone(), JobDispatcher::new(registry), clock.clone());

            Self {
                store,
                jobs,
                clock,
                enqueuer,
                scheduler,
                executor,
                cancel: CancellationToken::new(),
            }
        }

        async fn trigger(&self) {
            self.scheduler
                .trigger_now(PROCESS_FUNDING_SCHEDULES_QUEUE, self.cancel.clone())
                .await
                .unwrap();
        }

        async fn drain(&self) -> Vec<JobOutcome> {
            self.executor.run_until_idle(&self.cancel).await.unwrap()
        }

        async fn submit(&self, account: u64, bank_account: u64, schedules: &[u64]) {
            let arguments = ProcessFundingScheduleArguments {
                account_id: AccountId::new(account),
                bank_account_id: BankAccountId::new(bank_account),
                funding_schedule_ids: schedules.iter().copied().map(FundingScheduleId::new).collect(),
            };
            enqueue(&self.enqueuer, PROCESS_FUNDING_SCHEDULES_QUEUE, &arguments)
                .await
                .unwrap();
        }

        fn account(&self, account: u64, timezone: &str) {
            self.store
                .insert_account(Account::new(AccountId::new(account), timezone))
                .unwrap();
        }

        fn schedule(&self, id: u64, account: u64, bank_account: u64, next: DateTime<Utc>) {
            self.store
                .insert_funding_schedule(FundingSchedule {
                    funding_schedule_id: FundingScheduleId::new(id),
                    account_id: AccountId::new(account),
                    bank_account_id: BankAccountId::new(bank_account),
                    name: format!("Payday {id}"),
                    rule: "FREQ=MONTHLY;BYMONTHDAY=1".parse().unwrap(),
                    next_occurrence: next,
                    last_occurrence: None,
                })
                .unwrap();
        }

        fn goal(&self, id: u64, bank_account: u64, schedule: u64, paused: bool) {
            self.store
                .insert_spending(Spending {
                    spending_id: SpendingId::new(id),
                    bank_account_id: BankAccountId::new(bank_account),
                    funding_schedule_id: FundingScheduleId::new(schedule),
                    name: format!("Goal {id}"),
                    spending_type: SpendingType::Goal,
                    target_amount: 12_000,
                    current_amount: 0,
                    used_amount: 0,
                    next_contribution_amount: 1_000,
                    is_paused: paused,
                    recurrence_rule: None,
                    next_recurrence: utc(2025, 1, 1),
                    last_recurrence: None,
                })
                .unwrap();
        }

        fn spending(&self, id: u64) -> Spending {
            self.store.spending(SpendingId::new(id)).unwrap()
        }

        fn funding_schedule(&self, id: u64) -> FundingSchedule {
            self.store.funding_schedule(FundingScheduleId::new(id)).unwrap()
        }
    }

    #[tokio::test]
    async fn due_schedule_is_advanced_and_goal_funded() {
        let h = Harness::new(utc(2024, 3, 2));
        h.account(1, "UTC");
        h.schedule(10, 1, 5, utc(2024, 3, 1));
        h.goal(100, 5, 10, false);

        h.trigger().await;
        assert_eq!(h.drain().await, vec![JobOutcome::Succeeded]);

        let schedule = h.funding_schedule(10);
        assert_eq!(schedule.next_occurrence, utc(2024, 4, 1));
        assert_eq!(schedule.last_occurrence, Some(utc(2024, 3, 1)));

        let goal = h.spending(100);
        assert_eq!(goal.current_amount, 1_000);
        // 11000 remaining over Apr 1 2024 ..= Jan 1 2025 (10 paydays).
        assert_eq!(goal.next_contribution_amount, 1_100);

        // Finished jobs are not kept around.
        assert!(h.jobs.list_by_queue(PROCESS_FUNDING_SCHEDULES_QUEUE, 10).unwrap().is_empty());
        assert_eq!(h.jobs.stats().unwrap().completed, 1);

        // Nothing is due any more.
        h.trigger().await;
        assert!(h.drain().await.is_empty());
    }

    #[tokio::test]
    async fn premature_schedule_is_skipped_and_sibling_processed() {
        let h = Harness::new(utc(2024, 3, 2));
        h.account(1, "UTC");
        h.schedule(10, 1, 5, utc(2024, 3, 1));
        h.schedule(11, 1, 5, utc(2024, 4, 1));
        h.goal(100, 5, 10, false);
        h.goal(101, 5, 11, false);

        h.submit(1, 5, &[11, 10]).await;
        assert_eq!(h.drain().await, vec![JobOutcome::Succeeded]);

        assert_eq!(h.funding_schedule(11).next_occurrence, utc(2024, 4, 1));
        assert_eq!(h.funding_schedule(11).last_occurrence, None);
        assert_eq!(h.spending(101).current_amount, 0);

        assert_eq!(h.funding_schedule(10).next_occurrence, utc(2024, 4, 1));
        assert_eq!(h.spending(100).current_amount, 1_000);
    }

    #[tokio::test]
    async fn missing_schedule_fails_the_whole_envelope() {
        let h = Harness::new(utc(2024, 3, 2));
        h.account(1, "UTC");
        h.schedule(10, 1, 5, utc(2024, 3, 1));
        h.goal(100, 5, 10, false);

        h.submit(1, 5, &[10, 999]).await;
        let outcomes = h.drain().await;
        assert!(matches!(
            outcomes.as_slice(),
            [JobOutcome::Retrying(JobError::Repository(RepositoryError::NotFound { .. }))]
        ));

        assert_eq!(h.funding_schedule(10).next_occurrence, utc(2024, 3, 1));
        assert_eq!(h.funding_schedule(10).last_occurrence, None);
        assert_eq!(h.spending(100).current_amount, 0);
        assert_eq!(h.spending(100).next_contribution_amount, 1_000);
    }

    #[tokio::test]
    async fn paused_goal_is_left_alone() {
        let h = Harness::new(utc(2024, 3, 2));
        h.account(1, "UTC");
        h.schedule(10, 1, 5, utc(2024, 3, 1));
        h.goal(100, 5, 10, false);
        h.goal(101, 5, 10, true);
        let paused_before = h.spending(101);

        h.trigger().await;
        assert_eq!(h.drain().await, vec![JobOutcome::Succeeded]);

        assert_eq!(h.spending(100).current_amount, 1_000);
        assert_eq!(h.spending(101), paused_before);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_and_retry_succeeds() {
        let h = Harness::new(utc(2024, 3, 2));
        h.account(1, "UTC");
        h.schedule(10, 1, 5, utc(2024, 3, 1));
        h.goal(100, 5, 10, false);
        h.store.fail_next(FaultPoint::UpdateSpending, "disk full");

        h.trigger().await;
        assert!(matches!(h.drain().await.as_slice(), [JobOutcome::Retrying(_)]));
        assert_eq!(h.funding_schedule(10).next_occurrence, utc(2024, 3, 1));
        assert_eq!(h.spending(100).current_amount, 0);

        // Backoff has not elapsed yet.
        assert!(h.drain().await.is_empty());

        h.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(h.drain().await, vec![JobOutcome::Succeeded]);
        assert_eq!(h.funding_schedule(10).next_occurrence, utc(2024, 4, 1));
        assert_eq!(h.spending(100).current_amount, 1_000);

        let stats = h.executor.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn trigger_fans_out_one_job_per_bank_account() {
        let h = Harness::new(utc(2024, 3, 2));
        h.account(1, "UTC");
        h.account(2, "America/Chicago");
        h.schedule(10, 1, 5, utc(2024, 3, 1));
        h.schedule(11, 1, 5, utc(2024, 3, 1));
        h.schedule(12, 1, 6, utc(2024, 3, 1));
        h.schedule(20, 2, 7, utc(2024, 3, 1));
        h.schedule(21, 2, 7, utc(2024, 5, 1));

        h.trigger().await;

        let mut envelopes: Vec<ProcessFundingScheduleArguments> = h
            .jobs
            .list_by_queue(PROCESS_FUNDING_SCHEDULES_QUEUE, 10)
            .unwrap()
            .iter()
            .map(|job| serde_json::from_value(job.payload.clone()).unwrap())
            .collect();
        envelopes.sort_by_key(|e| e.bank_account_id);

        let groups: Vec<_> = envelopes
            .iter()
            .map(|e| (e.account_id.get(), e.bank_account_id.get(), e.funding_schedule_ids.len()))
            .collect();
        assert_eq!(groups, vec![(1, 5, 2), (1, 6, 1), (2, 7, 1)]);

        let outcomes = h.drain().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| *o == JobOutcome::Succeeded));
        assert_eq!(h.funding_schedule(21).next_occurrence, utc(2024, 5, 1));
    }

    #[tokio::test]
    async fn trigger_with_nothing_due_enqueues_nothing() {
        let h = Harness::new(utc(2024, 3, 2));
        h.account(1, "UTC");
        h.schedule(10, 1, 5, utc(2024, 4, 1));

        h.trigger().await;
        assert_eq!(h.jobs.stats().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_without_retry() {
        let h = Harness::new(utc(2024, 3, 2));
        let job = crate::jobs::Job::new(
            PROCESS_FUNDING_SCHEDULES_QUEUE,
            serde_json::json!({"accountId": "one"}),
            utc(2024, 3, 2),
        );
        h.jobs.enqueue(job).unwrap();

        assert!(matches!(
            h.drain().await.as_slice(),
            [JobOutcome::DeadLettered(JobError::MalformedPayload { .. })]
        ));
        let dead = h.jobs.list_dead_letters(10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.attempt, 1);
        assert!(matches!(dead[0].job.status, JobStatus::DeadLettered { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn unknown_timezone_fails_the_job() {
        let h = Harness::new(utc(2024, 3, 2));
        h.account(1, "Mars/Olympus_Mons");
        h.schedule(10, 1, 5, utc(2024, 3, 1));
        h.goal(100, 5, 10, false);

        h.trigger().await;
        assert!(matches!(h.drain().await.as_slice(), [JobOutcome::Retrying(JobError::Domain(_))]));
        assert_eq!(h.funding_schedule(10).next_occurrence, utc(2024, 3, 1));
    }
}
