//! Worker pool: claims jobs, dispatches them and records the outcome.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fundflow_core::Clock;

use super::context::JobContext;
use super::dispatcher::JobDispatcher;
use super::error::JobError;
use super::store::JobStore;
use super::types::{Job, JobStatus};

#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How long an idle worker waits before polling again
    pub poll_interval: Duration,
    /// Number of worker tasks
    pub concurrency: usize,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            concurrency: 4,
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub released: u64,
    pub current_running: usize,
}

/// How one delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Failed, scheduled for another attempt
    Retrying(JobError),
    DeadLettered(JobError),
    /// Cancelled mid-flight; returned to the queue
    Released,
}

/// Handle to a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Wait for all workers to stop (after the token passed to `spawn` is cancelled).
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "job worker panicked");
            }
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        lock_stats(&self.stats).clone()
    }
}

/// Background job executor.
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    dispatcher: JobDispatcher,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: JobDispatcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        lock_stats(&self.stats).clone()
    }

    /// Spawn `config.concurrency` worker tasks that run until `cancel` fires.
    pub fn spawn(&self, config: JobExecutorConfig, cancel: CancellationToken) -> JobExecutorHandle {
        let workers = (0..config.concurrency.max(1))
            .map(|worker| {
                let executor = self.clone();
                let config = config.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { executor.worker_loop(worker, config, cancel).await })
            })
            .collect();

        JobExecutorHandle {
            workers,
            stats: self.stats.clone(),
        }
    }

    /// Claim and run one ready job. Returns `None` when nothing is ready.
    pub async fn run_next(&self, cancel: &CancellationToken) -> Result<Option<JobOutcome>, JobError> {
        let Some(job) = self.store.claim_next(self.clock.now())? else {
            return Ok(None);
        };
        self.execute(job, cancel).await.map(Some)
    }

    /// Run jobs until none is ready, returning the outcomes in order.
    pub async fn run_until_idle(&self, cancel: &CancellationToken) -> Result<Vec<JobOutcome>, JobError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.run_next(cancel).await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn worker_loop(&self, worker: usize, config: JobExecutorConfig, cancel: CancellationToken) {
        info!(executor = %config.name, worker, "job worker started");
        let started = Instant::now();

        while !cancel.is_cancelled() {
            match self.run_next(&cancel).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(executor = %config.name, worker, error = %e, "failed to run job"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }

        info!(
            executor = %config.name,
            worker,
            uptime_secs = started.elapsed().as_secs(),
            "job worker stopped"
        );
    }

    async fn execute(&self, mut job: Job, cancel: &CancellationToken) -> Result<JobOutcome, JobError> {
        let ctx = JobContext::for_job(&job, cancel.clone());
        let started = self.clock.now();
        debug!(queue = %job.queue, job_id = %job.id, attempt = job.attempt, "job claimed");

        lock_stats(&self.stats).current_running += 1;
        let result = self.dispatcher.dispatch(&ctx, &job.payload).await;
        let now = self.clock.now();

        let outcome = match result {
            Ok(()) => {
                job.mark_completed(started, now);
                self.store.complete(&job)?;
                debug!(queue = %job.queue, job_id = %job.id, "job completed");
                JobOutcome::Succeeded
            }
            Err(JobError::Cancelled) => {
                job.release(now);
                self.store.update(&job)?;
                info!(queue = %job.queue, job_id = %job.id, "job released on shutdown");
                JobOutcome::Released
            }
            Err(err) if err.is_terminal() => {
                error!(queue = %job.queue, job_id = %job.id, error = %err, "job failed terminally");
                job.mark_dead(err.to_string(), now);
                self.store.dead_letter(job, err.to_string(), now)?;
                JobOutcome::DeadLettered(err)
            }
            Err(err) => {
                job.mark_failed(err.to_string(), started, now);
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    error!(
                        queue = %job.queue,
                        job_id = %job.id,
                        attempts = job.attempt,
                        error = %err,
                        "job exhausted retries"
                    );
                    self.store.dead_letter(job, err.to_string(), now)?;
                    JobOutcome::DeadLettered(err)
                } else {
                    warn!(
                        queue = %job.queue,
                        job_id = %job.id,
                        attempt = job.attempt,
                        retry_at = ?job.scheduled_at,
                        error = %err,
                        "job failed, will retry"
                    );
                    self.store.update(&job)?;
                    JobOutcome::Retrying(err)
                }
            }
        };

        let mut stats = lock_stats(&self.stats);
        stats.current_running = stats.current_running.saturating_sub(1);
        match &outcome {
            JobOutcome::Succeeded => {
                stats.processed += 1;
                stats.succeeded += 1;
            }
            JobOutcome::Retrying(_) => {
                stats.processed += 1;
                stats.failed += 1;
            }
            JobOutcome::DeadLettered(_) => {
                stats.processed += 1;
                stats.failed += 1;
                stats.dead_lettered += 1;
            }
            JobOutcome::Released => stats.released += 1,
        }

        Ok(outcome)
    }
}

fn lock_stats(stats: &Mutex<ExecutorStats>) -> std::sync::MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{
        HandlerRegistry, InMemoryJobStore, JobEnqueuer, JobHandler, RetryPolicy, StoreEnqueuer,
    };
    use chrono::{TimeZone, Utc};
    use fundflow_core::FixedClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times with a retryable error, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl JobHandler for Flaky {
        async fn consume(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), JobError> {
            let _: u64 = crate::jobs::codec::decode(ctx.queue(), payload)?;
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(crate::repository::RepositoryError::Storage("timeout".into()).into());
            }
            Ok(())
        }

        fn default_schedule(&self) -> Option<&str> {
            None
        }

        async fn enqueue_triggered(&self, _: &JobContext, _: &dyn JobEnqueuer) -> Result<(), JobError> {
            Ok(())
        }
    }

    struct Setup {
        store: Arc<InMemoryJobStore>,
        clock: Arc<FixedClock>,
        enqueuer: StoreEnqueuer,
        executor: JobExecutor,
    }

    fn setup(failures: u32, max_attempts: u32) -> Setup {
        let store = Arc::new(InMemoryJobStore::new());
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));

        let mut registry = HandlerRegistry::new();
        registry
            .register(
                "Flaky",
                Arc::new(Flaky {
                    failures,
                    calls: AtomicU32::new(0),
                }),
            )
            .unwrap();

        let enqueuer = StoreEnqueuer::new(store.clone(), clock.clone())
            .with_retry_policy(RetryPolicy::fixed(max_attempts, Duration::from_secs(30)));
        let executor = JobExecutor::new(
            store.clone(),
            JobDispatcher::new(Arc::new(registry)),
            clock.clone(),
        );

        Setup {
            store,
            clock,
            enqueuer,
            executor,
        }
    }

    #[tokio::test]
    async fn retries_after_backoff_then_succeeds() {
        let s = setup(1, 3);
        let cancel = CancellationToken::new();
        let id = s.enqueuer.enqueue_job("Flaky", serde_json::json!(1)).await.unwrap();

        let outcomes = s.executor.run_until_idle(&cancel).await.unwrap();
        assert!(matches!(outcomes.as_slice(), [JobOutcome::Retrying(_)]));

        // Backoff not elapsed yet.
        assert!(s.executor.run_until_idle(&cancel).await.unwrap().is_empty());

        s.clock.advance(chrono::Duration::seconds(30));
        let outcomes = s.executor.run_until_idle(&cancel).await.unwrap();
        assert_eq!(outcomes, vec![JobOutcome::Succeeded]);

        assert!(s.store.get(id).unwrap().is_none());
        assert_eq!(s.store.stats().unwrap().completed, 1);
        assert_eq!(s.executor.stats().succeeded, 1);
        assert_eq!(s.executor.stats().failed, 1);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters() {
        let s = setup(10, 2);
        let cancel = CancellationToken::new();
        s.enqueuer.enqueue_job("Flaky", serde_json::json!(1)).await.unwrap();

        s.executor.run_until_idle(&cancel).await.unwrap();
        s.clock.advance(chrono::Duration::seconds(30));
        let outcomes = s.executor.run_until_idle(&cancel).await.unwrap();

        assert!(matches!(outcomes.as_slice(), [JobOutcome::DeadLettered(_)]));
        assert_eq!(s.store.list_dead_letters(10).unwrap().len(), 1);
        assert_eq!(s.executor.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_without_retry() {
        let s = setup(0, 5);
        let cancel = CancellationToken::new();
        s.enqueuer
            .enqueue_job("Flaky", serde_json::json!({"not": "a number"}))
            .await
            .unwrap();

        let outcomes = s.executor.run_until_idle(&cancel).await.unwrap();
        assert!(matches!(
            outcomes.as_slice(),
            [JobOutcome::DeadLettered(JobError::MalformedPayload { .. })]
        ));

        let dls = s.store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert!(matches!(dls[0].job.status, JobStatus::DeadLettered { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn unknown_queue_is_dead_lettered() {
        let s = setup(0, 5);
        let cancel = CancellationToken::new();
        s.enqueuer.enqueue_job("Nobody", serde_json::json!(1)).await.unwrap();

        let outcomes = s.executor.run_until_idle(&cancel).await.unwrap();
        assert_eq!(
            outcomes,
            vec![JobOutcome::DeadLettered(JobError::HandlerNotFound("Nobody".into()))]
        );
    }

    #[tokio::test]
    async fn spawned_workers_drain_queue_and_stop_on_cancel() {
        let s = setup(0, 5);
        for i in 0..8 {
            s.enqueuer.enqueue_job("Flaky", serde_json::json!(i)).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let handle = s.executor.spawn(
            JobExecutorConfig::default()
                .with_concurrency(3)
                .with_poll_interval(Duration::from_millis(5)),
            cancel.clone(),
        );

        for _ in 0..200 {
            if handle.stats().succeeded == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.stats().succeeded, 8);

        cancel.cancel();
        handle.join().await;
        assert_eq!(s.store.stats().unwrap().completed, 8);
    }
}
