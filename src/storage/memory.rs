use super::{Enqueued, JobStore, LeaseStore};
use crate::clock::after;
use crate::errors::StorageError;
use crate::retry::Disposition;
use crate::schema::{Job, JobCounts, JobId, JobStatus, NewJob, WorkerLease};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, ready};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    keys: HashMap<String, JobId>,
    leases: HashMap<String, WorkerLease>,
}

/// In-process store with the same semantics as [`PgStore`](super::PgStore).
///
/// Every operation runs under one mutex, which gives the same atomicity the
/// conditional SQL statements give in Postgres. Clones share state, so
/// several runners built on clones behave like instances sharing a database.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate losing (`false`) or regaining (`true`) the connection.
    /// While unavailable every operation fails with [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Overwrite a stored job, bypassing every guard.
    #[cfg(test)]
    pub(crate) fn put_job(&self, job: Job) -> Result<(), StorageError> {
        self.with_state(|state| {
            state.keys.insert(job.idempotency_key.clone(), job.id);
            state.jobs.insert(job.id, job);
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T, StorageError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store is offline".into()));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".into()))?;
        Ok(f(&mut state))
    }

    fn run<'a, T: Send + 'a>(
        &self,
        f: impl FnOnce(&mut State) -> T,
    ) -> BoxFuture<'a, Result<T, StorageError>> {
        ready(self.with_state(f)).boxed()
    }

    /// Apply `update` to a job whose status is `expected`.
    fn transition<'a>(
        &self,
        id: JobId,
        expected: JobStatus,
        update: impl FnOnce(&mut Job),
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        self.run(|state| match state.jobs.get_mut(&id) {
            Some(job) if job.status == expected => {
                update(job);
                true
            }
            _ => false,
        })
    }
}

fn sorted_by<K: Ord>(mut jobs: Vec<Job>, key: impl Fn(&Job) -> K) -> Vec<Job> {
    jobs.sort_by_key(|job| key(job));
    jobs
}

fn take(jobs: Vec<Job>, limit: u32) -> Vec<Job> {
    jobs.into_iter().take(limit as usize).collect()
}

impl JobStore for MemoryStore {
    fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> BoxFuture<'_, Result<Enqueued, StorageError>> {
        self.run(|state| {
            if let Some(existing) = state.keys.get(&job.idempotency_key).and_then(|id| state.jobs.get(id)) {
                return Enqueued::Existing(existing.clone());
            }
            let job = job.into_job(now);
            state.keys.insert(job.idempotency_key.clone(), job.id);
            state.jobs.insert(job.id, job.clone());
            Enqueued::Created(job)
        })
    }

    fn claim_next_ready<'a>(
        &'a self,
        job_types: &'a [String],
        limit: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<Job>, StorageError>> {
        self.run(|state| {
            let ready: Vec<Job> = state
                .jobs
                .values()
                .filter(|job| {
                    job.status == JobStatus::Pending
                        && job.next_run_at <= now
                        && job_types.iter().any(|t| *t == job.job_type)
                })
                .cloned()
                .collect();

            let mut claimed = take(sorted_by(ready, |job| (job.created_at, job.id)), limit);
            for job in &mut claimed {
                job.status = JobStatus::Processing;
                job.updated_at = now;
                if let Some(stored) = state.jobs.get_mut(&job.id) {
                    stored.clone_from(job);
                }
            }
            claimed
        })
    }

    fn mark_completed(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>> {
        self.transition(id, JobStatus::Processing, |job| {
            job.status = JobStatus::Completed;
            job.attempts += 1;
            job.updated_at = now;
            job.completed_at = Some(now);
        })
    }

    fn mark_failed<'a>(
        &'a self,
        id: JobId,
        error: &'a str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        self.transition(id, JobStatus::Processing, |job| {
            job.status = JobStatus::Pending;
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            job.next_run_at = next_run_at;
            job.updated_at = now;
        })
    }

    fn mark_dead_letter<'a>(
        &'a self,
        id: JobId,
        error: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        self.transition(id, JobStatus::Processing, |job| {
            job.status = JobStatus::DeadLetter;
            job.attempts += 1;
            job.last_error = Some(error.to_string());
            job.updated_at = now;
        })
    }

    fn touch(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>> {
        self.transition(id, JobStatus::Processing, |job| job.updated_at = now)
    }

    fn find_stale(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<Job>, StorageError>> {
        self.run(|state| {
            let stale: Vec<Job> = state
                .jobs
                .values()
                .filter(|job| job.status == JobStatus::Processing && job.updated_at < stale_before)
                .cloned()
                .collect();
            take(sorted_by(stale, |job| (job.updated_at, job.id)), limit)
        })
    }

    fn reclaim_stale<'a>(
        &'a self,
        id: JobId,
        stale_before: DateTime<Utc>,
        disposition: Disposition,
        error: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        self.run(|state| match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing && job.updated_at < stale_before => {
                job.attempts += 1;
                job.last_error = Some(error.to_string());
                job.updated_at = now;
                match disposition {
                    Disposition::Retry { next_run_at } => {
                        job.status = JobStatus::Pending;
                        job.next_run_at = next_run_at;
                    }
                    Disposition::DeadLetter => job.status = JobStatus::DeadLetter,
                }
                true
            }
            _ => false,
        })
    }

    fn get(&self, id: JobId) -> BoxFuture<'_, Result<Option<Job>, StorageError>> {
        self.run(|state| state.jobs.get(&id).cloned())
    }

    fn find_by_idempotency_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Job>, StorageError>> {
        self.run(|state| state.keys.get(key).and_then(|id| state.jobs.get(id)).cloned())
    }

    fn counts(&self) -> BoxFuture<'_, Result<JobCounts, StorageError>> {
        self.run(|state| {
            let mut counts = JobCounts::default();
            for job in state.jobs.values() {
                counts.add(job.status, 1);
            }
            counts
        })
    }

    fn list_dead_letters(&self, limit: u32) -> BoxFuture<'_, Result<Vec<Job>, StorageError>> {
        self.run(|state| {
            let dead: Vec<Job> = state
                .jobs
                .values()
                .filter(|job| job.status == JobStatus::DeadLetter)
                .cloned()
                .collect();
            take(sorted_by(dead, |job| std::cmp::Reverse((job.updated_at, job.id))), limit)
        })
    }

    fn requeue_dead_letter(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>> {
        self.transition(id, JobStatus::DeadLetter, |job| {
            job.status = JobStatus::Pending;
            job.attempts = 0;
            job.next_run_at = now;
            job.updated_at = now;
        })
    }

    fn discard(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>> {
        self.run(|state| match state.jobs.get_mut(&id) {
            Some(job) if matches!(job.status, JobStatus::Pending | JobStatus::DeadLetter) => {
                job.status = JobStatus::Failed;
                job.updated_at = now;
                true
            }
            _ => false,
        })
    }
}

impl LeaseStore for MemoryStore {
    fn try_acquire<'a>(
        &'a self,
        worker_name: &'a str,
        instance_id: &'a str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        self.run(|state| {
            let acquired_at = match state.leases.get(worker_name) {
                Some(lease) if lease.instance_id == instance_id && lease.is_valid_at(now) => {
                    lease.acquired_at
                }
                Some(lease) if lease.is_valid_at(now) => return false,
                _ => now,
            };
            state.leases.insert(
                worker_name.to_string(),
                WorkerLease {
                    worker_name: worker_name.to_string(),
                    instance_id: instance_id.to_string(),
                    acquired_at,
                    last_heartbeat: now,
                    lease_expires_at: after(now, ttl),
                },
            );
            true
        })
    }

    fn renew<'a>(
        &'a self,
        worker_name: &'a str,
        instance_id: &'a str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        self.run(|state| match state.leases.get_mut(worker_name) {
            Some(lease) if lease.instance_id == instance_id => {
                lease.last_heartbeat = now;
                lease.lease_expires_at = after(now, ttl);
                true
            }
            _ => false,
        })
    }

    fn release<'a>(
        &'a self,
        worker_name: &'a str,
        instance_id: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        self.run(|state| match state.leases.get_mut(worker_name) {
            Some(lease) if lease.instance_id == instance_id => {
                lease.lease_expires_at = lease.lease_expires_at.min(now);
                true
            }
            _ => false,
        })
    }

    fn current<'a>(&'a self, worker_name: &'a str) -> BoxFuture<'a, Result<Option<WorkerLease>, StorageError>> {
        self.run(|state| state.leases.get(worker_name).cloned())
    }
}
