use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::errors::{HandlerError, StorageError};
use crate::job_registry::JobRegistry;
use crate::lease::LeaseManager;
use crate::reclaimer::Reclaimer;
use crate::retry::Disposition;
use crate::schema::{Job, JobStatus};
use crate::storage::JobStore;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// The store write that records how an attempt ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Completed,
    Failed { error: String, next_run_at: DateTime<Utc> },
    DeadLetter { error: String },
}

/// Why a dispatcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchExit {
    /// The term token was cancelled (shutdown or failed renewal)
    Cancelled,
    /// The local lease view expired before a claim
    LeaseLost,
    /// Nothing was claimable and the runner is set to stop on an empty queue
    QueueEmpty,
}

/// The claim / execute / record loop run by the lease holder.
pub(crate) struct Dispatcher<Context> {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) lease: Arc<LeaseManager>,
    pub(crate) reclaimer: Reclaimer,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: Arc<WorkerConfig>,
    pub(crate) shutdown_when_queue_empty: bool,
    /// Results of finished attempts whose write failed, kept for the next term.
    pub(crate) unrecorded: Mutex<Vec<(Job, Outcome)>>,
}

impl<Context: Clone + Send + Sync + 'static> Dispatcher<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        let poll_interval = self.config.poll_interval();
        let jitter = self.config.poll_jitter();
        if jitter.is_zero() {
            return poll_interval;
        }

        let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        poll_interval + Duration::from_millis(random_jitter)
    }

    /// Dispatch until `term` is cancelled, the lease is gone, or (if so
    /// configured) the queue is empty.
    ///
    /// A recovery pass runs before the first claim and then every
    /// `reclaim_interval`.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self, term: &CancellationToken) -> DispatchExit {
        let job_types = self.job_registry.job_types();
        let mut storage_failures = 0_u32;
        let mut reclaim_due = Instant::now();

        loop {
            if term.is_cancelled() {
                return DispatchExit::Cancelled;
            }
            if !self.lease.holds() {
                return DispatchExit::LeaseLost;
            }

            if let Err(error) = self.flush_unrecorded().await {
                storage_failures += 1;
                if !self.back_off(storage_failures, &error, term).await {
                    return DispatchExit::Cancelled;
                }
                continue;
            }

            if Instant::now() >= reclaim_due {
                match self.reclaimer.run_pass().await {
                    Ok(report) => {
                        if report.total() > 0 {
                            info!(requeued = report.requeued, dead_lettered = report.dead_lettered, "Recovery pass finished");
                        }
                        reclaim_due = Instant::now() + self.config.reclaim_interval();
                    }
                    Err(error) => {
                        storage_failures += 1;
                        if !self.back_off(storage_failures, &error, term).await {
                            return DispatchExit::Cancelled;
                        }
                        continue;
                    }
                }
            }

            match self.run_batch(&job_types, term).await {
                Ok(claimed) if claimed > 0 => storage_failures = 0,
                Ok(_) if self.shutdown_when_queue_empty => {
                    debug!("No ready jobs found. Shutting down the dispatcher…");
                    return DispatchExit::QueueEmpty;
                }
                Ok(_) => {
                    storage_failures = 0;
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No ready jobs found. Polling again in {sleep_duration:?}…");
                    tokio::select! {
                        _ = term.cancelled() => return DispatchExit::Cancelled,
                        _ = sleep(sleep_duration) => {}
                    }
                }
                Err(error) => {
                    storage_failures += 1;
                    if !self.back_off(storage_failures, &error, term).await {
                        return DispatchExit::Cancelled;
                    }
                }
            }
        }
    }

    /// Sleep after a storage failure. Returns `false` if cancelled meanwhile.
    async fn back_off(&self, failures: u32, error: &StorageError, term: &CancellationToken) -> bool {
        let delay = self.config.storage_backoff(failures);
        error!(%error, failures, "Storage error, pausing dispatch for {delay:?}");
        tokio::select! {
            _ = term.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    /// Claim one batch and run it. Returns the number of claimed jobs.
    ///
    /// Jobs claimed but not started when the term ends stay `processing` and
    /// are picked up by a later recovery pass. Only the claim itself can fail
    /// the batch.
    async fn run_batch(&self, job_types: &[String], term: &CancellationToken) -> Result<usize, StorageError> {
        trace!("Looking for ready jobs…");
        let jobs = self
            .store
            .claim_next_ready(job_types, self.config.batch_size, self.clock.now())
            .await?;
        let claimed = jobs.len();

        for job in jobs {
            if term.is_cancelled() || !self.lease.holds() {
                warn!(job.id = %job.id, "Lease no longer held, leaving claimed job for recovery");
                break;
            }
            self.run_job(job, term).await;
        }

        Ok(claimed)
    }

    async fn run_job(&self, job: Job, term: &CancellationToken) {
        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type, job.attempt = job.attempts + 1);
        async {
            debug!("Running job…");
            let cancel = term.child_token();
            let job_timeout = self.config.job_timeout();

            let execution = with_sentry_transaction(&job.job_type, || async {
                let Some(run_task_fn) = self.job_registry.get(&job.job_type) else {
                    return Err(HandlerError::retryable(anyhow!("Unknown job type {}", job.job_type)));
                };

                let future = AssertUnwindSafe(run_task_fn(
                    self.context.clone(),
                    job.payload.clone(),
                    cancel.clone(),
                ))
                .catch_unwind();

                match timeout(job_timeout, future).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(HandlerError::retryable(try_to_extract_panic_info(&*panic))),
                    Err(_) => {
                        cancel.cancel();
                        Err(HandlerError::retryable(anyhow!(
                            "job exceeded its execution limit of {job_timeout:?}"
                        )))
                    }
                }
            })
            .bind_hub(Hub::current());
            tokio::pin!(execution);

            let every = self.config.job_heartbeat();
            let mut heartbeat = interval_at(Instant::now() + every, every);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let result = loop {
                tokio::select! {
                    biased;
                    _ = term.cancelled() => {
                        cancel.cancel();
                        warn!("Dispatch stopped mid-job, leaving it in processing for recovery");
                        return;
                    }
                    result = &mut execution => break result,
                    _ = heartbeat.tick() => self.heartbeat(&job).await,
                }
            };

            self.record_outcome(&job, result, term).await;
        }
        .instrument(span)
        .await
    }

    async fn heartbeat(&self, job: &Job) {
        match self.store.touch(job.id, self.clock.now()).await {
            Ok(true) => trace!("Job heartbeat recorded"),
            Ok(false) => warn!("Job is no longer processing, it was reclaimed or finished elsewhere"),
            Err(error) => warn!(%error, "Failed to record job heartbeat"),
        }
    }

    /// Persist the result of an attempt, retrying the write through storage
    /// errors for as long as this term lasts.
    ///
    /// If the term ends first the outcome is kept and written at the start of
    /// the next one, before any recovery pass could pick the job up again.
    async fn record_outcome(&self, job: &Job, result: Result<(), HandlerError>, term: &CancellationToken) {
        let outcome = match result {
            Ok(()) => {
                debug!("Job completed");
                Outcome::Completed
            }
            Err(error) => {
                let message = error.to_string();
                match self.config.retry.disposition(job, error.is_permanent(), self.clock.now()) {
                    Disposition::Retry { next_run_at } => {
                        warn!(%next_run_at, "Failed to run job: {message}");
                        Outcome::Failed { error: message, next_run_at }
                    }
                    Disposition::DeadLetter => {
                        error!(permanent = error.is_permanent(), "Job moved to dead letter: {message}");
                        Outcome::DeadLetter { error: message }
                    }
                }
            }
        };

        let mut failures = 0_u32;
        loop {
            match self.write_outcome(job, &outcome).await {
                Ok(true) => return,
                Ok(false) => {
                    warn!("Job was no longer processing, outcome discarded");
                    return;
                }
                Err(error) => {
                    failures += 1;
                    if !self.lease.holds() || !self.back_off(failures, &error, term).await {
                        warn!(%error, "Dispatch stopped before the outcome was stored, keeping it for later");
                        self.unrecorded().push((job.clone(), outcome));
                        return;
                    }
                }
            }
        }
    }

    async fn write_outcome(&self, job: &Job, outcome: &Outcome) -> Result<bool, StorageError> {
        let now = self.clock.now();
        match outcome {
            Outcome::Completed => self.store.mark_completed(job.id, now).await,
            Outcome::Failed { error, next_run_at } => self.store.mark_failed(job.id, error, *next_run_at, now).await,
            Outcome::DeadLetter { error } => self.store.mark_dead_letter(job.id, error, now).await,
        }
    }

    /// Write outcomes left over from an earlier term.
    ///
    /// An outcome only applies while its job is still `processing` at the same
    /// attempt. Anything else means the job was reclaimed in the meantime.
    pub(crate) async fn flush_unrecorded(&self) -> Result<(), StorageError> {
        let pending = std::mem::take(&mut *self.unrecorded());
        let mut pending = pending.into_iter();

        while let Some((job, outcome)) = pending.next() {
            let result = async {
                match self.store.get(job.id).await? {
                    Some(current) if current.status == JobStatus::Processing && current.attempts == job.attempts => {
                        self.write_outcome(&job, &outcome).await
                    }
                    _ => Ok(false),
                }
            }
            .await;

            match result {
                Ok(true) => info!(job.id = %job.id, "Stored outcome left over from an earlier term"),
                Ok(false) => warn!(job.id = %job.id, "Job moved on before its outcome was stored, outcome discarded"),
                Err(error) => {
                    let mut unrecorded = self.unrecorded();
                    unrecorded.push((job, outcome));
                    unrecorded.extend(pending);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    fn unrecorded(&self) -> MutexGuard<'_, Vec<(Job, Outcome)>> {
        self.unrecorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
