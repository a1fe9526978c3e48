//! Recovery of jobs orphaned in `processing`.
//!
//! A job is abandoned once its `updated_at` is older than `stale_after`.
//! Running handlers refresh `updated_at` through the job heartbeat, and the
//! execution ceiling is shorter than `stale_after`, so only jobs whose worker
//! died (or lost its lease mid-job) ever cross the threshold.

use crate::clock::{Clock, before};
use crate::errors::StorageError;
use crate::retry::{Disposition, RetryPolicy};
use crate::storage::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PAGE_SIZE: u32 = 100;

/// Outcome of one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Jobs sent back to `pending`
    pub requeued: usize,
    /// Jobs that had no attempts left
    pub dead_lettered: usize,
}

impl ReclaimReport {
    /// Total number of reclaimed jobs.
    pub fn total(&self) -> usize {
        self.requeued + self.dead_lettered
    }
}

/// Treats abandoned jobs as failed attempts.
#[derive(Debug, Clone)]
pub struct Reclaimer {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    policy: RetryPolicy,
}

impl Reclaimer {
    /// Reclaim jobs untouched for `stale_after`, retrying them per `policy`.
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            stale_after,
            policy,
        }
    }

    /// Reclaim every job that is stale right now.
    ///
    /// Safe to run concurrently with a dispatcher and with other passes: each
    /// job is reclaimed by a single guarded write, and a job that was
    /// finished or touched in the meantime is left alone.
    pub async fn run_pass(&self) -> Result<ReclaimReport, StorageError> {
        let now = self.clock.now();
        let stale_before = before(now, self.stale_after);
        let mut report = ReclaimReport::default();

        loop {
            let stale = self.store.find_stale(stale_before, PAGE_SIZE).await?;
            let page_len = stale.len();
            let mut reclaimed_in_page = 0;

            for job in stale {
                let disposition = self.policy.disposition(&job, false, now);
                let error = format!(
                    "abandoned in processing, last update at {}",
                    job.updated_at.to_rfc3339()
                );

                let reclaimed = self
                    .store
                    .reclaim_stale(job.id, stale_before, disposition, &error, now)
                    .await?;
                if !reclaimed {
                    debug!(job.id = %job.id, "Stale job changed before it could be reclaimed");
                    continue;
                }

                reclaimed_in_page += 1;
                match disposition {
                    Disposition::Retry { next_run_at } => {
                        report.requeued += 1;
                        info!(job.id = %job.id, job.type = %job.job_type, %next_run_at, "Reclaimed abandoned job");
                    }
                    Disposition::DeadLetter => {
                        report.dead_lettered += 1;
                        warn!(job.id = %job.id, job.type = %job.job_type, "Abandoned job has no attempts left, dead-lettered");
                    }
                }
            }

            if page_len < PAGE_SIZE as usize || reclaimed_in_page == 0 {
                break;
            }
        }

        Ok(report)
    }
}
