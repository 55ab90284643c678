//! Job storage implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Drop a finished job. Only the completion count is kept.
    fn complete(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest pending or failed job that is ready at `now`, marking it running.
    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    fn list_by_queue(&self, queue: &str, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Move a job to the dead-letter queue.
    fn dead_letter(&self, job: Job, reason: String, now: DateTime<Utc>) -> Result<(), JobStoreError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead-lettered job back to pending with a fresh attempt budget.
    fn retry_dead_letter(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
    completed: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs.read().map_err(|_| poisoned())
    }

    fn jobs_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs.write().map_err(|_| poisoned())
    }

    fn dead_letters_mut(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<JobId, DeadLetterEntry>>, JobStoreError> {
        self.dead_letters.write().map_err(|_| poisoned())
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".into())
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs_mut()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs()?.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_mut()?;
        match jobs.get_mut(&job.id) {
            Some(slot) => {
                *slot = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    fn complete(&self, job: &Job) -> Result<(), JobStoreError> {
        self.jobs_mut()?
            .remove(&job.id)
            .ok_or(JobStoreError::NotFound(job.id))?;
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs_mut()?;

        // FIFO by creation time; ids are v7 so they break ties in order too.
        let next = jobs
            .values()
            .filter(|j| j.status.is_claimable() && j.is_ready(now))
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.mark_running(now);
            Some(job.clone())
        }))
    }

    fn list_by_queue(&self, queue: &str, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let mut result: Vec<_> = self
            .jobs()?
            .values()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id.0));
        result.truncate(limit);
        Ok(result)
    }

    fn dead_letter(&self, mut job: Job, reason: String, now: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs_mut()?;
        let mut dls = self.dead_letters_mut()?;

        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.mark_dead(reason.clone(), now);
        }

        jobs.remove(&job.id);
        dls.insert(
            job.id,
            DeadLetterEntry {
                job,
                dead_lettered_at: now,
                reason,
            },
        );
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = dls.values().cloned().collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs_mut()?;
        let mut dls = self.dead_letters_mut()?;

        let entry = dls.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = now;
        job.history.clear();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs()?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;

        let mut stats = JobStats {
            completed: self.completed.load(Ordering::Relaxed),
            ..JobStats::default()
        };
        for job in jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        stats.dead_lettered += dls.len();

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(queue: &str, i: i64) -> Job {
        let created = Utc::now() + chrono::Duration::milliseconds(i);
        Job::new(queue, serde_json::json!({ "i": i }), created)
    }

    #[test]
    fn enqueue_and_claim_in_fifo_order() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(job("a", 0)).unwrap();
        let second = store.enqueue(job("b", 1)).unwrap();
        let now = Utc::now() + chrono::Duration::seconds(1);

        let claimed = store.claim_next(now).unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);

        assert_eq!(store.claim_next(now).unwrap().unwrap().id, second);
        assert!(store.claim_next(now).unwrap().is_none());
    }

    #[test]
    fn backoff_delays_claim() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(job("a", 0)).unwrap();

        let mut claimed = store.claim_next(now).unwrap().unwrap();
        claimed.mark_failed("boom".into(), now, now);
        store.update(&claimed).unwrap();

        assert!(store.claim_next(now).unwrap().is_none());
        let later = claimed.scheduled_at.unwrap();
        assert_eq!(store.claim_next(later).unwrap().unwrap().attempt, 2);
    }

    #[test]
    fn dead_letter_and_retry() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(job("a", 0)).unwrap();

        let claimed = store.claim_next(now).unwrap().unwrap();
        store.dead_letter(claimed, "malformed".into(), now).unwrap();

        assert!(store.get(id).unwrap().is_none());
        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].reason, "malformed");
        assert!(matches!(dls[0].job.status, JobStatus::DeadLettered { attempts: 1, .. }));

        let retried = store.retry_dead_letter(id, now).unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert!(store.list_dead_letters(10).unwrap().is_empty());
        assert!(matches!(
            store.retry_dead_letter(id, now),
            Err(JobStoreError::NotFound(missing)) if missing == id
        ));
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.enqueue(job("a", i)).unwrap();
        }
        let now = Utc::now() + chrono::Duration::seconds(1);
        store.claim_next(now).unwrap();
        store.claim_next(now).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);
        assert_eq!(store.list_by_queue("a", 10).unwrap().len(), 5);
    }

    #[test]
    fn completed_jobs_are_dropped_but_counted() {
        let store = InMemoryJobStore::new();
        let now = Utc::now() + chrono::Duration::seconds(1);
        for i in 0..100 {
            store.enqueue(job("a", i)).unwrap();
        }

        while let Some(mut claimed) = store.claim_next(now).unwrap() {
            claimed.mark_completed(now, now);
            store.complete(&claimed).unwrap();
        }

        assert!(store.list_by_queue("a", 1000).unwrap().is_empty());
        let stats = store.stats().unwrap();
        assert_eq!(stats.completed, 100);
        assert_eq!(stats.pending + stats.running, 0);

        let unknown = job("a", 0);
        assert_eq!(store.complete(&unknown), Err(JobStoreError::NotFound(unknown.id)));
    }
}
