use super::{Enqueued, JobStore, LeaseStore};
use crate::clock::after;
use crate::errors::StorageError;
use crate::retry::Disposition;
use crate::schema::{Job, JobCounts, JobId, JobStatus, NewJob, WorkerLease};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::PgPool;
use sqlx::migrate::MigrateError;
use std::time::Duration;

/// Create or upgrade the `jobs` and `worker_leases` tables.
pub async fn setup_database(pool: &PgPool) -> Result<(), MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Postgres-backed store shared by every instance of the service.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing connection pool. See [`setup_database`] for the schema.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn limit(value: u32) -> i64 {
    i64::from(value)
}

impl JobStore for PgStore {
    fn enqueue(&self, job: NewJob, now: DateTime<Utc>) -> BoxFuture<'_, Result<Enqueued, StorageError>> {
        async move {
            let inserted = sqlx::query_as::<_, Job>(
                r"
                INSERT INTO jobs (id, job_type, idempotency_key, payload, status, attempts,
                                  max_attempts, next_run_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $6, $6)
                ON CONFLICT (idempotency_key) DO NOTHING
                RETURNING *
                ",
            )
            .bind(JobId::new())
            .bind(&job.job_type)
            .bind(&job.idempotency_key)
            .bind(&job.payload)
            .bind(job.max_attempts)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(created) = inserted {
                return Ok(Enqueued::Created(created));
            }

            // The conflicting insert has committed by the time DO NOTHING returns.
            sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE idempotency_key = $1")
                .bind(&job.idempotency_key)
                .fetch_optional(&self.pool)
                .await?
                .map(Enqueued::Existing)
                .ok_or_else(|| {
                    StorageError::InvalidRow(format!(
                        "idempotency key `{}` conflicted but no row is visible",
                        job.idempotency_key
                    ))
                })
        }
        .boxed()
    }

    fn claim_next_ready<'a>(
        &'a self,
        job_types: &'a [String],
        limit_to: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<Job>, StorageError>> {
        async move {
            let mut jobs = sqlx::query_as::<_, Job>(
                r"
                UPDATE jobs
                SET status = 'processing', updated_at = $3
                WHERE status = 'pending'
                  AND id IN (
                    SELECT id
                    FROM jobs
                    WHERE status = 'pending'
                      AND next_run_at <= $3
                      AND job_type = ANY($1)
                    ORDER BY created_at ASC, id ASC
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                  )
                RETURNING *
                ",
            )
            .bind(job_types)
            .bind(limit(limit_to))
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

            // RETURNING does not preserve the subquery order.
            jobs.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
            Ok(jobs)
        }
        .boxed()
    }

    fn mark_completed(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>> {
        async move {
            let result = sqlx::query(
                r"
                UPDATE jobs
                SET status = 'completed', attempts = attempts + 1, updated_at = $2, completed_at = $2
                WHERE id = $1 AND status = 'processing'
                ",
            )
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
        .boxed()
    }

    fn mark_failed<'a>(
        &'a self,
        id: JobId,
        error: &'a str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        async move {
            let result = sqlx::query(
                r"
                UPDATE jobs
                SET status = 'pending', attempts = attempts + 1, last_error = $2,
                    next_run_at = $3, updated_at = $4
                WHERE id = $1 AND status = 'processing'
                ",
            )
            .bind(id)
            .bind(error)
            .bind(next_run_at)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
        .boxed()
    }

    fn mark_dead_letter<'a>(
        &'a self,
        id: JobId,
        error: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        async move {
            let result = sqlx::query(
                r"
                UPDATE jobs
                SET status = 'dead_letter', attempts = attempts + 1, last_error = $2, updated_at = $3
                WHERE id = $1 AND status = 'processing'
                ",
            )
            .bind(id)
            .bind(error)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
        .boxed()
    }

    fn touch(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>> {
        async move {
            let result =
                sqlx::query("UPDATE jobs SET updated_at = $2 WHERE id = $1 AND status = 'processing'")
                    .bind(id)
                    .bind(now)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() == 1)
        }
        .boxed()
    }

    fn find_stale(
        &self,
        stale_before: DateTime<Utc>,
        limit_to: u32,
    ) -> BoxFuture<'_, Result<Vec<Job>, StorageError>> {
        async move {
            let jobs = sqlx::query_as::<_, Job>(
                r"
                SELECT * FROM jobs
                WHERE status = 'processing' AND updated_at < $1
                ORDER BY updated_at ASC, id ASC
                LIMIT $2
                ",
            )
            .bind(stale_before)
            .bind(limit(limit_to))
            .fetch_all(&self.pool)
            .await?;
            Ok(jobs)
        }
        .boxed()
    }

    fn reclaim_stale<'a>(
        &'a self,
        id: JobId,
        stale_before: DateTime<Utc>,
        disposition: Disposition,
        error: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        async move {
            let query = match disposition {
                Disposition::Retry { next_run_at } => sqlx::query(
                    r"
                    UPDATE jobs
                    SET status = 'pending', attempts = attempts + 1, last_error = $3,
                        next_run_at = $5, updated_at = $4
                    WHERE id = $1 AND status = 'processing' AND updated_at < $2
                    ",
                )
                .bind(id)
                .bind(stale_before)
                .bind(error)
                .bind(now)
                .bind(next_run_at),
                Disposition::DeadLetter => sqlx::query(
                    r"
                    UPDATE jobs
                    SET status = 'dead_letter', attempts = attempts + 1, last_error = $3, updated_at = $4
                    WHERE id = $1 AND status = 'processing' AND updated_at < $2
                    ",
                )
                .bind(id)
                .bind(stale_before)
                .bind(error)
                .bind(now),
            };
            let result = query.execute(&self.pool).await?;
            Ok(result.rows_affected() == 1)
        }
        .boxed()
    }

    fn get(&self, id: JobId) -> BoxFuture<'_, Result<Option<Job>, StorageError>> {
        async move {
            let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(job)
        }
        .boxed()
    }

    fn find_by_idempotency_key<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Job>, StorageError>> {
        async move {
            let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE idempotency_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            Ok(job)
        }
        .boxed()
    }

    fn counts(&self) -> BoxFuture<'_, Result<JobCounts, StorageError>> {
        async move {
            let rows = sqlx::query_as::<_, (String, i64)>(
                "SELECT status, COUNT(*) FROM jobs GROUP BY status",
            )
            .fetch_all(&self.pool)
            .await?;

            let mut counts = JobCounts::default();
            for (status, count) in rows {
                counts.add(status.parse::<JobStatus>()?, count);
            }
            Ok(counts)
        }
        .boxed()
    }

    fn list_dead_letters(&self, limit_to: u32) -> BoxFuture<'_, Result<Vec<Job>, StorageError>> {
        async move {
            let jobs = sqlx::query_as::<_, Job>(
                r"
                SELECT * FROM jobs
                WHERE status = 'dead_letter'
                ORDER BY updated_at DESC, id DESC
                LIMIT $1
                ",
            )
            .bind(limit(limit_to))
            .fetch_all(&self.pool)
            .await?;
            Ok(jobs)
        }
        .boxed()
    }

    fn requeue_dead_letter(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>> {
        async move {
            let result = sqlx::query(
                r"
                UPDATE jobs
                SET status = 'pending', attempts = 0, next_run_at = $2, updated_at = $2
                WHERE id = $1 AND status = 'dead_letter'
                ",
            )
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
        .boxed()
    }

    fn discard(&self, id: JobId, now: DateTime<Utc>) -> BoxFuture<'_, Result<bool, StorageError>> {
        async move {
            let result = sqlx::query(
                r"
                UPDATE jobs
                SET status = 'failed', updated_at = $2
                WHERE id = $1 AND status IN ('pending', 'dead_letter')
                ",
            )
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
        .boxed()
    }
}

impl LeaseStore for PgStore {
    fn try_acquire<'a>(
        &'a self,
        worker_name: &'a str,
        instance_id: &'a str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        async move {
            // The WHERE clause of DO UPDATE is re-checked against the locked
            // row, so concurrent acquirers of an expired lease serialize here.
            let acquired = sqlx::query_scalar::<_, String>(
                r"
                INSERT INTO worker_leases (worker_name, instance_id, acquired_at, last_heartbeat, lease_expires_at)
                VALUES ($1, $2, $3, $3, $4)
                ON CONFLICT (worker_name) DO UPDATE
                SET instance_id = EXCLUDED.instance_id,
                    acquired_at = CASE
                        WHEN worker_leases.instance_id = EXCLUDED.instance_id
                         AND worker_leases.lease_expires_at > EXCLUDED.last_heartbeat
                        THEN worker_leases.acquired_at
                        ELSE EXCLUDED.acquired_at
                    END,
                    last_heartbeat = EXCLUDED.last_heartbeat,
                    lease_expires_at = EXCLUDED.lease_expires_at
                WHERE worker_leases.lease_expires_at <= EXCLUDED.last_heartbeat
                   OR worker_leases.instance_id = EXCLUDED.instance_id
                RETURNING worker_name
                ",
            )
            .bind(worker_name)
            .bind(instance_id)
            .bind(now)
            .bind(after(now, ttl))
            .fetch_optional(&self.pool)
            .await?;
            Ok(acquired.is_some())
        }
        .boxed()
    }

    fn renew<'a>(
        &'a self,
        worker_name: &'a str,
        instance_id: &'a str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        async move {
            let result = sqlx::query(
                r"
                UPDATE worker_leases
                SET last_heartbeat = $3, lease_expires_at = $4
                WHERE worker_name = $1 AND instance_id = $2
                ",
            )
            .bind(worker_name)
            .bind(instance_id)
            .bind(now)
            .bind(after(now, ttl))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
        .boxed()
    }

    fn release<'a>(
        &'a self,
        worker_name: &'a str,
        instance_id: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        async move {
            let result = sqlx::query(
                r"
                UPDATE worker_leases
                SET lease_expires_at = LEAST(lease_expires_at, $3)
                WHERE worker_name = $1 AND instance_id = $2
                ",
            )
            .bind(worker_name)
            .bind(instance_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
        .boxed()
    }

    fn current<'a>(&'a self, worker_name: &'a str) -> BoxFuture<'a, Result<Option<WorkerLease>, StorageError>> {
        async move {
            let lease =
                sqlx::query_as::<_, WorkerLease>("SELECT * FROM worker_leases WHERE worker_name = $1")
                    .bind(worker_name)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(lease)
        }
        .boxed()
    }
}
