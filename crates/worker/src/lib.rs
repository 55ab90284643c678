//! Worker process: wires storage, the handler registry, the worker pool and
//! the cron trigger together.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fundflow_core::Clock;
use fundflow_infra::config::{ConfigError, WorkerConfig};
use fundflow_infra::funding::{PROCESS_FUNDING_SCHEDULES_QUEUE, ProcessFundingScheduleHandler};
use fundflow_infra::jobs::{
    HandlerRegistry, InMemoryJobStore, JobDispatcher, JobError, JobExecutor, JobScheduler, JobStore,
    StoreEnqueuer,
};
use fundflow_infra::repository::{
    Database, InMemoryStore, JobRepository, PostgresDatabase, RepositoryError,
};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Where funding data lives.
#[derive(Debug, Clone)]
pub enum Storage {
    InMemory(InMemoryStore),
    Postgres(PostgresDatabase),
}

impl Storage {
    /// PostgreSQL when `DATABASE_URL` is configured, an empty in-memory store otherwise.
    pub async fn connect(config: &WorkerConfig) -> Result<Self, WorkerError> {
        match &config.database_url {
            Some(url) => {
                let db = PostgresDatabase::connect(url, config.db_max_connections).await?;
                info!(max_connections = config.db_max_connections, "connected to postgres");
                Ok(Self::Postgres(db))
            }
            None => {
                info!("DATABASE_URL not set; using in-memory storage");
                Ok(Self::InMemory(InMemoryStore::new()))
            }
        }
    }

    fn database(&self) -> Arc<dyn Database> {
        match self {
            Self::InMemory(store) => Arc::new(store.clone()),
            Self::Postgres(db) => Arc::new(db.clone()),
        }
    }

    fn job_repository(&self) -> Arc<dyn JobRepository> {
        match self {
            Self::InMemory(store) => Arc::new(store.clone()),
            Self::Postgres(db) => Arc::new(db.clone()),
        }
    }
}

pub struct Worker {
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
    job_store: Arc<dyn JobStore>,
    executor: JobExecutor,
    scheduler: JobScheduler,
}

impl Worker {
    /// Build the registry and job machinery over `storage`.
    ///
    /// Fails if a configured schedule override is invalid or names an unknown queue.
    pub fn build(config: WorkerConfig, storage: &Storage, clock: Arc<dyn Clock>) -> Result<Self, WorkerError> {
        let mut registry = HandlerRegistry::new();
        registry.register(
            PROCESS_FUNDING_SCHEDULES_QUEUE,
            Arc::new(ProcessFundingScheduleHandler::new(
                storage.database(),
                storage.job_repository(),
                clock.clone(),
            )),
        )?;
        let registry = Arc::new(registry);

        let job_store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let enqueuer =
            StoreEnqueuer::new(job_store.clone(), clock.clone()).with_retry_policy(config.retry_policy());
        let scheduler = JobScheduler::new(registry.clone(), Arc::new(enqueuer), clock.clone())
            .with_overrides(config.schedules.clone());
        scheduler.schedules()?;

        let executor = JobExecutor::new(job_store.clone(), JobDispatcher::new(registry), clock.clone());

        Ok(Self {
            config,
            clock,
            job_store,
            executor,
            scheduler,
        })
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.job_store
    }

    /// Run one trigger cycle for `queue` immediately.
    pub async fn trigger_now(&self, queue: &str) -> Result<(), WorkerError> {
        self.scheduler.trigger_now(queue, CancellationToken::new()).await?;
        Ok(())
    }

    /// Run the worker pool and triggers until `shutdown` resolves, then drain.
    pub async fn run<F>(self, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()>,
    {
        let cancel = CancellationToken::new();

        let executor = self.executor.spawn(self.config.executor_config(), cancel.clone());
        let triggers = self.scheduler.spawn(cancel.clone())?;

        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            triggers = triggers.len(),
            "worker started"
        );
        if let Ok(upcoming) = self.scheduler.upcoming(self.clock.now()) {
            for (queue, at) in upcoming {
                info!(queue = %queue, next_run = %at, "trigger scheduled");
            }
        }

        shutdown.await;
        info!("shutdown requested, waiting for in-flight jobs");
        cancel.cancel();

        for trigger in triggers {
            if let Err(e) = trigger.await {
                error!(error = %e, "trigger task panicked");
            }
        }
        executor.join().await;
        let stats = self.executor.stats();

        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            dead_lettered = stats.dead_lettered,
            "worker stopped"
        );
        Ok(())
    }
}
