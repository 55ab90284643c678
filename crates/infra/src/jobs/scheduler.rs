//! Cron-driven trigger loops.
//!
//! One loop per registered handler that has a schedule. Each fire time calls
//! the handler's `enqueue_triggered`; errors are logged and the loop keeps going.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info};

use fundflow_core::Clock;

use super::context::JobContext;
use super::enqueuer::JobEnqueuer;
use super::error::JobError;
use super::handler::JobHandler;
use super::registry::HandlerRegistry;

pub struct JobScheduler {
    registry: Arc<HandlerRegistry>,
    enqueuer: Arc<dyn JobEnqueuer>,
    clock: Arc<dyn Clock>,
    overrides: HashMap<String, String>,
}

impl JobScheduler {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        enqueuer: Arc<dyn JobEnqueuer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            enqueuer,
            clock,
            overrides: HashMap::new(),
        }
    }

    /// Per-queue cron expressions replacing the handlers' defaults.
    pub fn with_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Resolved schedule for every queue that has one, validated.
    pub fn schedules(&self) -> Result<Vec<(String, Schedule)>, JobError> {
        if let Some(queue) = self
            .overrides
            .keys()
            .find(|queue| self.registry.get(queue).is_none())
        {
            return Err(JobError::HandlerNotFound(queue.clone()));
        }

        let mut schedules = Vec::new();
        for (queue, handler) in self.registry.iter() {
            let expression = match self.overrides.get(queue) {
                Some(expression) => expression.as_str(),
                None => match handler.default_schedule() {
                    Some(expression) => expression,
                    None => continue,
                },
            };
            let schedule = Schedule::from_str(expression).map_err(|e| JobError::InvalidSchedule {
                queue: queue.to_string(),
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
            schedules.push((queue.to_string(), schedule));
        }
        Ok(schedules)
    }

    /// Next fire time of each scheduled queue after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>, JobError> {
        Ok(self
            .schedules()?
            .into_iter()
            .filter_map(|(queue, schedule)| schedule.after(&after).next().map(|at| (queue, at)))
            .collect())
    }

    /// Run one trigger cycle for `queue` now.
    pub async fn trigger_now(&self, queue: &str, cancel: CancellationToken) -> Result<(), JobError> {
        let handler = self
            .registry
            .get(queue)
            .ok_or_else(|| JobError::HandlerNotFound(queue.to_string()))?;
        run_trigger(handler.as_ref(), self.enqueuer.as_ref(), queue, cancel).await
    }

    /// Start one trigger loop per scheduled queue; loops exit when `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, JobError> {
        let mut handles = Vec::new();
        for (queue, schedule) in self.schedules()? {
            let Some(handler) = self.registry.get(&queue).cloned() else {
                continue;
            };
            let enqueuer = self.enqueuer.clone();
            let clock = self.clock.clone();
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                trigger_loop(queue, schedule, handler, enqueuer, clock, cancel).await;
            }));
        }
        Ok(handles)
    }
}

async fn trigger_loop(
    queue: String,
    schedule: Schedule,
    handler: Arc<dyn JobHandler>,
    enqueuer: Arc<dyn JobEnqueuer>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    info!(queue = %queue, "trigger started");
    let mut previous = None;

    loop {
        let now = clock.now();
        let Some(next) = next_fire_time(&schedule, now, previous) else {
            info!(queue = %queue, "schedule has no further fire times");
            break;
        };
        previous = Some(next);
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if let Err(e) = run_trigger(handler.as_ref(), enqueuer.as_ref(), &queue, cancel.clone()).await {
            error!(queue = %queue, error = %e, "trigger run failed");
        }
    }

    info!(queue = %queue, "trigger stopped");
}

/// First fire time after both `now` and the slot already fired.
fn next_fire_time(
    schedule: &Schedule,
    now: DateTime<Utc>,
    previous: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let from = previous.map_or(now, |previous| previous.max(now));
    schedule.after(&from).next()
}

async fn run_trigger(
    handler: &dyn JobHandler,
    enqueuer: &dyn JobEnqueuer,
    queue: &str,
    cancel: CancellationToken,
) -> Result<(), JobError> {
    let ctx = JobContext::new(queue, cancel);
    let span = ctx.span().clone();
    tokio::select! {
        biased;
        _ = ctx.cancellation().cancelled() => Err(JobError::Cancelled),
        result = handler.enqueue_triggered(&ctx, enqueuer).instrument(span) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobStore, StoreEnqueuer, enqueue};
    use chrono::TimeZone;
    use fundflow_core::FixedClock;

    struct Hourly;

    #[async_trait::async_trait]
    impl JobHandler for Hourly {
        async fn consume(&self, _: &JobContext, _: &serde_json::Value) -> Result<(), JobError> {
            Ok(())
        }

        fn default_schedule(&self) -> Option<&str> {
            Some("0 0 * * * *")
        }

        async fn enqueue_triggered(&self, ctx: &JobContext, enqueuer: &dyn JobEnqueuer) -> Result<(), JobError> {
            enqueue(enqueuer, ctx.queue(), &serde_json::json!({"from": "trigger"})).await?;
            Ok(())
        }
    }

    struct Manual;

    #[async_trait::async_trait]
    impl JobHandler for Manual {
        async fn consume(&self, _: &JobContext, _: &serde_json::Value) -> Result<(), JobError> {
            Ok(())
        }

        fn default_schedule(&self) -> Option<&str> {
            None
        }

        async fn enqueue_triggered(&self, _: &JobContext, _: &dyn JobEnqueuer) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn scheduler(store: Arc<InMemoryJobStore>) -> JobScheduler {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mut registry = HandlerRegistry::new();
        registry.register("Hourly", Arc::new(Hourly)).unwrap();
        registry.register("Manual", Arc::new(Manual)).unwrap();
        JobScheduler::new(
            Arc::new(registry),
            Arc::new(StoreEnqueuer::new(store, clock.clone())),
            clock,
        )
    }

    #[test]
    fn only_scheduled_handlers_get_a_trigger() {
        let s = scheduler(Arc::new(InMemoryJobStore::new()));
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();

        assert_eq!(
            s.upcoming(after).unwrap(),
            vec![("Hourly".to_string(), Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap())]
        );
    }

    #[test]
    fn overrides_replace_defaults_and_are_validated() {
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();

        let s = scheduler(Arc::new(InMemoryJobStore::new()))
            .with_overrides(HashMap::from([("Hourly".to_string(), "0 30 * * * *".to_string())]));
        assert_eq!(
            s.upcoming(after).unwrap()[0].1,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap()
        );

        let s = scheduler(Arc::new(InMemoryJobStore::new()))
            .with_overrides(HashMap::from([("Hourly".to_string(), "every hour".to_string())]));
        assert!(matches!(s.schedules(), Err(JobError::InvalidSchedule { .. })));

        let s = scheduler(Arc::new(InMemoryJobStore::new()))
            .with_overrides(HashMap::from([("Typo".to_string(), "0 0 * * * *".to_string())]));
        assert_eq!(s.schedules().unwrap_err(), JobError::HandlerNotFound("Typo".into()));
    }

    #[tokio::test]
    async fn trigger_now_enqueues() {
        let store = Arc::new(InMemoryJobStore::new());
        let s = scheduler(store.clone());

        s.trigger_now("Hourly", CancellationToken::new()).await.unwrap();
        let jobs = store.list_by_queue("Hourly", 10).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload, serde_json::json!({"from": "trigger"}));

        assert_eq!(
            s.trigger_now("Nope", CancellationToken::new()).await,
            Err(JobError::HandlerNotFound("Nope".into()))
        );
    }

    #[test]
    fn early_wakeup_does_not_repeat_a_fire_time() {
        let schedule = Schedule::from_str("0 0 * * * *").unwrap();
        let fired = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
        let early = fired - chrono::Duration::milliseconds(3);

        assert_eq!(next_fire_time(&schedule, early, None), Some(fired));
        assert_eq!(
            next_fire_time(&schedule, early, Some(fired)),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );

        // A clock that jumped ahead skips the missed slots.
        let late = Utc.with_ymd_and_hms(2024, 5, 1, 14, 20, 0).unwrap();
        assert_eq!(
            next_fire_time(&schedule, late, Some(fired)),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap())
        );
    }
}
