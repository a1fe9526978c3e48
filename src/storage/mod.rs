//! Durable state of the queue.
//!
//! Two traits cover the whole footprint: [`JobStore`] for the `jobs` table and
//! [`LeaseStore`] for the `worker_leases` table. Every mutation is a single
//! conditional write, so no operation needs a transaction spanning both.
//!
//! All timestamps are supplied by the caller. The runner reads them from its
//! [`Clock`](crate::Clock), which keeps retry and lease arithmetic
//! independent of the database server's clock.

use crate::errors::StorageError;
use crate::retry::Disposition;
use crate::schema::{Job, JobCounts, JobId, NewJob, WorkerLease};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use std::fmt::Debug;
use std::time::Duration;

mod memory;
mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::{PgStore, setup_database};

/// Result of an idempotent enqueue.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// A new job row was inserted
    Created(Job),
    /// A job with the same idempotency key already existed and is returned unchanged
    Existing(Job),
}

impl Enqueued {
    /// The stored job, new or pre-existing.
    pub fn job(&self) -> &Job {
        match self {
            Self::Created(job) | Self::Existing(job) => job,
        }
    }

    /// Consume and return the stored job.
    pub fn into_job(self) -> Job {
        match self {
            Self::Created(job) | Self::Existing(job) => job,
        }
    }

    /// Whether the call collapsed onto an existing job.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Existing(_))
    }
}

/// Storage for job rows.
///
/// State transitions out of `processing` are guarded by the current status
/// and report `false` instead of failing when the guard rejects the write.
/// That happens when a superseded worker reports on a job that was already
/// reclaimed or finished elsewhere.
pub trait JobStore: Debug + Send + Sync + 'static {
    /// Insert `job` as `pending`, or return the row that already holds its
    /// idempotency key.
    fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> BoxFuture<'_, Result<Enqueued, StorageError>>;

    /// Atomically move up to `limit` ready jobs of the given types to
    /// `processing`, oldest first.
    fn claim_next_ready<'a>(
        &'a self,
        job_types: &'a [String],
        limit: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<Job>, StorageError>>;

    /// `processing` → `completed`.
    fn mark_completed(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>>;

    /// `processing` → `pending`, claimable again at `next_run_at`.
    fn mark_failed<'a>(
        &'a self,
        id: JobId,
        error: &'a str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// `processing` → `dead_letter`.
    fn mark_dead_letter<'a>(
        &'a self,
        id: JobId,
        error: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Refresh `updated_at` of a job that is still `processing`.
    fn touch(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>>;

    /// `processing` jobs last updated before `stale_before`, oldest first.
    fn find_stale(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<Job>, StorageError>>;

    /// Apply `disposition` to a stale job.
    ///
    /// Guarded by both `status = processing` and `updated_at < stale_before`,
    /// so a job is reclaimed at most once and never after its handler
    /// touched it again.
    fn reclaim_stale<'a>(
        &'a self,
        id: JobId,
        stale_before: DateTime<Utc>,
        disposition: Disposition,
        error: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Look up a job by id.
    fn get(&self, id: JobId) -> BoxFuture<'_, Result<Option<Job>, StorageError>>;

    /// Look up a job by idempotency key.
    fn find_by_idempotency_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Job>, StorageError>>;

    /// Number of jobs per status.
    fn counts(&self) -> BoxFuture<'_, Result<JobCounts, StorageError>>;

    /// Most recently dead-lettered jobs first.
    fn list_dead_letters(&self, limit: u32) -> BoxFuture<'_, Result<Vec<Job>, StorageError>>;

    /// `dead_letter` → `pending` with a fresh attempt budget.
    fn requeue_dead_letter(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>>;

    /// `pending` or `dead_letter` → `failed`. The row is kept but never claimed again.
    fn discard(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>>;
}

/// Storage for worker leases, one row per logical worker role.
pub trait LeaseStore: Debug + Send + Sync + 'static {
    /// Take the lease if it is absent, expired or already ours.
    ///
    /// Implementations must decide this in one conditional write so that of
    /// several instances racing for an expired lease exactly one wins.
    fn try_acquire<'a>(
        &'a self,
        worker_name: &'a str,
        instance_id: &'a str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Extend the lease, only if `instance_id` is still the holder.
    fn renew<'a>(
        &'a self,
        worker_name: &'a str,
        instance_id: &'a str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// Expire the lease right away if `instance_id` holds it.
    fn release<'a>(
        &'a self,
        worker_name: &'a str,
        instance_id: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>>;

    /// The stored lease row, valid or not.
    fn current<'a>(&'a self, worker_name: &'a str) -> BoxFuture<'a, Result<Option<WorkerLease>, StorageError>>;
}
