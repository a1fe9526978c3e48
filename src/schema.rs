//! Database schema definitions for SQLx.
//!
//! This module contains the row types for the two tables that make up the
//! whole durable footprint of the queue: `jobs` and `worker_leases`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a job, generated when the job is first enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new, time-ordered job id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed once `next_run_at` has passed.
    Pending,
    /// Claimed by a dispatcher and currently executing.
    Processing,
    /// Finished successfully.
    Completed,
    /// Discarded by an operator. Kept for audit, never claimed again.
    Failed,
    /// Exhausted its attempts or failed permanently. Never retried automatically.
    DeadLetter,
}

impl JobStatus {
    /// The value stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a `status` column holds an unknown value.
#[derive(Debug, thiserror::Error)]
#[error("unknown job status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Represents a job record in the database
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct Job {
    /// Unique identifier for the job
    pub id: JobId,
    /// Type identifier for the job (used for dispatch)
    pub job_type: String,
    /// Deterministic key derived from the triggering event
    pub idempotency_key: String,
    /// JSON data containing the job payload
    pub payload: Value,
    /// Current lifecycle state
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    /// Number of finished execution attempts
    pub attempts: i32,
    /// Ceiling on attempts before the job is dead-lettered
    pub max_attempts: i32,
    /// The job must not be claimed before this instant
    pub next_run_at: DateTime<Utc>,
    /// Detail of the most recent failure
    pub last_error: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state change or heartbeat
    pub updated_at: DateTime<Utc>,
    /// Timestamp when the job completed successfully
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether another failure would still leave room for a retry.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts.saturating_add(1) < self.max_attempts
    }
}

/// A job that has not been stored yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Handler selector
    pub job_type: String,
    /// Unique key collapsing duplicate triggers onto one job
    pub idempotency_key: String,
    /// Handler input
    pub payload: Value,
    /// Attempt ceiling
    pub max_attempts: i32,
}

impl NewJob {
    /// Build the stored row for this job at `now`.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: JobId::new(),
            job_type: self.job_type,
            idempotency_key: self.idempotency_key,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            next_run_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Represents the lease row for one logical worker role
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct WorkerLease {
    /// Logical role, one row per role
    pub worker_name: String,
    /// Process instance currently holding the lease
    pub instance_id: String,
    /// When the current holder acquired the lease
    pub acquired_at: DateTime<Utc>,
    /// Last successful renewal
    pub last_heartbeat: DateTime<Utc>,
    /// The lease is valid strictly before this instant
    pub lease_expires_at: DateTime<Utc>,
}

impl WorkerLease {
    /// A lease is valid iff it expires after `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at > now
    }
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Waiting for their first or next attempt
    pub pending: i64,
    /// Claimed by a dispatcher
    pub processing: i64,
    /// Finished successfully
    pub completed: i64,
    /// Discarded by an operator
    pub failed: i64,
    /// Out of attempts or failed permanently
    pub dead_letter: i64,
}

impl JobCounts {
    pub(crate) fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::DeadLetter => self.dead_letter += count,
        }
    }

    /// Total number of stored jobs.
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.dead_letter
    }
}
