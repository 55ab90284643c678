//! Background job system: queues, handlers, retries and dead letters.
//!
//! ## Design
//!
//! - A job is a JSON payload addressed to a named queue
//! - Each queue has exactly one `JobHandler` (consume / default schedule /
//!   enqueue on trigger), registered in an explicit `HandlerRegistry`
//! - `JobDispatcher` routes deliveries; `execute_in_transaction` gives a
//!   handler one account-scoped unit of work
//! - `JobExecutor` is the worker pool; failed jobs retry with backoff and end
//!   in the dead-letter queue when the budget runs out (or immediately when the
//!   failure is terminal)
//! - `JobScheduler` runs cron triggers
//!
//! Cancellation flows through `JobContext` as a `CancellationToken`.

pub mod codec;
pub mod context;
pub mod dispatcher;
pub mod enqueuer;
pub mod error;
pub mod executor;
pub mod handler;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use context::JobContext;
pub use dispatcher::{JobDispatcher, TransactionalJob, execute_in_transaction};
pub use enqueuer::{JobEnqueuer, StoreEnqueuer, enqueue};
pub use error::JobError;
pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobOutcome};
pub use handler::JobHandler;
pub use registry::HandlerRegistry;
pub use scheduler::JobScheduler;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{BackoffStrategy, DeadLetterEntry, Job, JobAttemptRecord, JobId, JobStatus, RetryPolicy};
