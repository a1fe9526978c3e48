#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use claims::{assert_ok, assert_some};
use leased_workers::schema::{Job, JobId, JobStatus};
use leased_workers::{
    BackgroundJob, Clock, HandlerError, IdempotencyKey, JobStore, KeyError, LeaseStore, ManualClock,
    MemoryStore, Reclaimer, RetryPolicy, Runner, StopReason, WorkerConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    /// Real-time cadences are a few milliseconds; everything measured by the
    /// clock (lease TTL, staleness, retry delays) only moves when the test
    /// advances the [`ManualClock`].
    pub(super) fn config() -> WorkerConfig {
        WorkerConfig {
            worker_name: "test-dispatcher".into(),
            lease_ttl_ms: 15_000,
            heartbeat_interval_ms: 10,
            poll_interval_ms: 10,
            poll_jitter_ms: 0,
            batch_size: 5,
            job_timeout_ms: 5_000,
            job_heartbeat_ms: 20,
            stale_after_ms: 300_000,
            reclaim_interval_ms: 50,
            storage_backoff_base_ms: 10,
            storage_backoff_max_ms: 50,
            retry: RetryPolicy::fixed(Duration::ZERO, 2.0, Duration::ZERO),
        }
    }

    pub(super) fn create_test_runner<Context: Clone + Send + Sync + 'static>(
        store: &MemoryStore,
        clock: &ManualClock,
        context: Context,
    ) -> Runner<Context> {
        Runner::new(store.clone(), context)
            .config(config())
            .clock(clock.clone())
    }

    pub(super) async fn enqueue<J: BackgroundJob>(store: &MemoryStore, clock: &ManualClock, job: J) -> JobId {
        job.enqueue(store, clock.now()).await.unwrap().into_job().id
    }

    /// Poll the store until the job satisfies `done`.
    pub(super) async fn wait_for_job(store: &MemoryStore, id: JobId, done: impl Fn(&Job) -> bool) -> Job {
        let poll = async {
            loop {
                if let Ok(Some(job)) = store.get(id).await {
                    if done(&job) {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(10), poll)
            .await
            .expect("job never reached the expected state")
    }

    pub(super) async fn wait_for(what: &str, condition: impl Fn() -> bool) {
        let poll = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(10), poll).await.is_err() {
            panic!("timed out waiting for {what}");
        }
    }
}

use test_utils::{create_test_runner, enqueue, t0, wait_for, wait_for_job};

fn test_key() -> Result<IdempotencyKey, KeyError> {
    IdempotencyKey::new("test", "1")
}

#[tokio::test]
async fn jobs_are_completed_when_successfully_run() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_TYPE: &'static str = "test";
        type Context = Arc<AtomicUsize>;

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            test_key()
        }

        async fn run(&self, runs: Self::Context, _cancel: CancellationToken) -> Result<(), HandlerError> {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let runs = Arc::new(AtomicUsize::new(0));
    let id = enqueue(&store, &clock, TestJob).await;

    let runner = create_test_runner(&store, &clock, runs.clone())
        .register::<TestJob>()
        .shutdown_when_queue_empty()
        .start()?;
    assert_eq!(runner.wait_for_shutdown().await, StopReason::QueueEmpty);

    let job = assert_some!(store.get(id).await?);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The lease is given back on the way out.
    let lease = assert_some!(store.current("test-dispatcher").await?);
    assert!(!lease.is_valid_at(clock.now()));
    Ok(())
}

#[tokio::test]
async fn failed_jobs_are_retried_with_growing_delays_then_dead_lettered() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct FlakyJob;

    impl BackgroundJob for FlakyJob {
        const JOB_TYPE: &'static str = "flaky";
        const MAX_ATTEMPTS: i32 = 4;
        type Context = ();

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            test_key()
        }

        async fn run(&self, _ctx: (), _cancel: CancellationToken) -> Result<(), HandlerError> {
            Err(HandlerError::retryable(anyhow::anyhow!("upstream returned 503")))
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let id = enqueue(&store, &clock, FlakyJob).await;

    let mut config = test_utils::config();
    config.retry = RetryPolicy::fixed(Duration::from_secs(1), 2.0, Duration::from_secs(60));
    let runner = create_test_runner(&store, &clock, ())
        .config(config)
        .register::<FlakyJob>()
        .start()?;

    let mut delays = Vec::new();
    for attempt in 1..=3 {
        let job = wait_for_job(&store, id, |job| job.attempts == attempt).await;
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some("upstream returned 503"));

        let delay = job.next_run_at - job.updated_at;
        delays.push(delay);
        clock.advance(delay.to_std()?);
    }
    assert_eq!(delays, [1, 2, 4].map(TimeDelta::seconds));

    let job = wait_for_job(&store, id, |job| job.status == JobStatus::DeadLetter).await;
    assert_eq!(job.attempts, 4);

    runner.shutdown();
    assert_eq!(runner.wait_for_shutdown().await, StopReason::Shutdown);
    Ok(())
}

#[tokio::test]
async fn permanent_failures_skip_remaining_attempts() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct InvalidJob;

    impl BackgroundJob for InvalidJob {
        const JOB_TYPE: &'static str = "invalid";
        type Context = Arc<AtomicUsize>;

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            test_key()
        }

        async fn run(&self, runs: Self::Context, _cancel: CancellationToken) -> Result<(), HandlerError> {
            runs.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::permanent(anyhow::anyhow!("recipient address is malformed")))
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let runs = Arc::new(AtomicUsize::new(0));
    let id = enqueue(&store, &clock, InvalidJob).await;

    let runner = create_test_runner(&store, &clock, runs.clone())
        .register::<InvalidJob>()
        .shutdown_when_queue_empty()
        .start()?;
    assert_eq!(runner.wait_for_shutdown().await, StopReason::QueueEmpty);

    let job = assert_some!(store.get(id).await?);
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("recipient address is malformed"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn panicking_jobs_are_retried_like_failures() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct PanicJob;

    impl BackgroundJob for PanicJob {
        const JOB_TYPE: &'static str = "panic";
        const MAX_ATTEMPTS: i32 = 2;
        type Context = ();

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            test_key()
        }

        async fn run(&self, _ctx: (), _cancel: CancellationToken) -> Result<(), HandlerError> {
            panic!("transcript was not utf-8");
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let id = enqueue(&store, &clock, PanicJob).await;

    let runner = create_test_runner(&store, &clock, ())
        .register::<PanicJob>()
        .shutdown_when_queue_empty()
        .start()?;
    assert_eq!(runner.wait_for_shutdown().await, StopReason::QueueEmpty);

    let job = assert_some!(store.get(id).await?);
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert_eq!(job.attempts, 2);
    assert!(job.last_error.unwrap().contains("transcript was not utf-8"));
    Ok(())
}

#[tokio::test]
async fn jobs_exceeding_their_timeout_are_failed() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct HangingJob;

    impl BackgroundJob for HangingJob {
        const JOB_TYPE: &'static str = "hanging";
        const MAX_ATTEMPTS: i32 = 1;
        type Context = ();

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            test_key()
        }

        async fn run(&self, _ctx: (), _cancel: CancellationToken) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let id = enqueue(&store, &clock, HangingJob).await;

    let mut config = test_utils::config();
    config.job_timeout_ms = 50;
    let runner = create_test_runner(&store, &clock, ())
        .config(config)
        .register::<HangingJob>()
        .shutdown_when_queue_empty()
        .start()?;
    assert_eq!(runner.wait_for_shutdown().await, StopReason::QueueEmpty);

    let job = assert_some!(store.get(id).await?);
    assert_eq!(job.status, JobStatus::DeadLetter);
    assert!(job.last_error.unwrap().contains("execution limit"));
    Ok(())
}

#[derive(Clone, Default)]
struct BlockingContext {
    runs: Arc<AtomicUsize>,
    release: Arc<Notify>,
}

/// Blocks on its first run until released, completes right away afterwards.
#[derive(Serialize, Deserialize)]
struct BlockingJob;

impl BackgroundJob for BlockingJob {
    const JOB_TYPE: &'static str = "blocking";
    type Context = BlockingContext;

    fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
        test_key()
    }

    async fn run(&self, ctx: Self::Context, _cancel: CancellationToken) -> Result<(), HandlerError> {
        if ctx.runs.fetch_add(1, Ordering::SeqCst) == 0 {
            ctx.release.notified().await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn another_instance_takes_over_after_a_crash() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let ctx = BlockingContext::default();
    let id = enqueue(&store, &clock, BlockingJob).await;

    let first = create_test_runner(&store, &clock, ctx.clone())
        .instance_id("instance-a")
        .register::<BlockingJob>()
        .start()?;
    wait_for("first run to start", || ctx.runs.load(Ordering::SeqCst) == 1).await;
    assert!(first.holds_lease());

    // Instance A dies mid-job: no release, no outcome.
    first.abort().await;
    let orphaned = assert_some!(store.get(id).await?);
    assert_eq!(orphaned.status, JobStatus::Processing);

    clock.advance(Duration::from_secs(301));

    let second = create_test_runner(&store, &clock, ctx.clone())
        .instance_id("instance-b")
        .register::<BlockingJob>()
        .shutdown_when_queue_empty()
        .start()?;
    assert_eq!(second.wait_for_shutdown().await, StopReason::QueueEmpty);

    let job = assert_some!(store.get(id).await?);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(ctx.runs.load(Ordering::SeqCst), 2);

    let lease = assert_some!(store.current("test-dispatcher").await?);
    assert_eq!(lease.instance_id, "instance-b");
    Ok(())
}

#[tokio::test]
async fn slow_jobs_that_heartbeat_are_never_reclaimed() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let ctx = BlockingContext::default();
    let id = enqueue(&store, &clock, BlockingJob).await;

    let mut config = test_utils::config();
    config.lease_ttl_ms = 600_000;
    let runner = create_test_runner(&store, &clock, ctx.clone())
        .config(config)
        .register::<BlockingJob>()
        .shutdown_when_queue_empty()
        .start()?;
    wait_for("job to start", || ctx.runs.load(Ordering::SeqCst) == 1).await;

    let policy = RetryPolicy::fixed(Duration::ZERO, 2.0, Duration::ZERO);
    let reclaimer = Reclaimer::new(
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        Duration::from_secs(300),
        policy,
    );

    // Well past the stale threshold in total, but the job heartbeat keeps up.
    for _ in 0..5 {
        clock.advance(Duration::from_secs(100));
        let now = clock.now();
        wait_for_job(&store, id, |job| job.updated_at == now).await;
        assert_eq!(reclaimer.run_pass().await?.total(), 0);
    }

    ctx.release.notify_one();
    assert_eq!(runner.wait_for_shutdown().await, StopReason::QueueEmpty);

    let job = assert_some!(store.get(id).await?);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(ctx.runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn storage_outages_do_not_stop_the_runner() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_TYPE: &'static str = "test";
        type Context = Arc<AtomicUsize>;

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            test_key()
        }

        async fn run(&self, runs: Self::Context, _cancel: CancellationToken) -> Result<(), HandlerError> {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let runs = Arc::new(AtomicUsize::new(0));

    let runner = create_test_runner(&store, &clock, runs.clone())
        .register::<TestJob>()
        .start()?;
    wait_for("lease acquisition", || runner.holds_lease()).await;

    store.set_available(false);
    tokio::time::sleep(Duration::from_millis(150)).await;
    store.set_available(true);

    let id = enqueue(&store, &clock, TestJob).await;
    let job = wait_for_job(&store, id, |job| job.status == JobStatus::Completed).await;
    assert_eq!(job.attempts, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    runner.shutdown();
    assert_eq!(runner.wait_for_shutdown().await, StopReason::Shutdown);
    Ok(())
}

#[tokio::test]
async fn outcomes_survive_a_storage_outage_right_after_the_job_ran() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct Context {
        store: MemoryStore,
        runs: Arc<AtomicUsize>,
    }

    #[derive(Serialize, Deserialize)]
    struct SendEmailJob;

    impl BackgroundJob for SendEmailJob {
        const JOB_TYPE: &'static str = "send-email";
        type Context = Context;

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            test_key()
        }

        async fn run(&self, ctx: Self::Context, _cancel: CancellationToken) -> Result<(), HandlerError> {
            ctx.runs.fetch_add(1, Ordering::SeqCst);
            // The mail is out, and the database goes away before the result is stored.
            ctx.store.set_available(false);
            let store = ctx.store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                store.set_available(true);
            });
            Ok(())
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let runs = Arc::new(AtomicUsize::new(0));
    let id = enqueue(&store, &clock, SendEmailJob).await;

    let ctx = Context {
        store: store.clone(),
        runs: runs.clone(),
    };
    let runner = create_test_runner(&store, &clock, ctx)
        .register::<SendEmailJob>()
        .start()?;

    let job = wait_for_job(&store, id, |job| job.status == JobStatus::Completed).await;
    assert_eq!(job.attempts, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Past the staleness threshold a recovery pass would rerun a job left in processing.
    clock.advance(Duration::from_secs(301));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let job = assert_some!(store.get(id).await?);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    runner.shutdown();
    assert_eq!(runner.wait_for_shutdown().await, StopReason::Shutdown);
    Ok(())
}

#[tokio::test]
async fn only_one_of_several_instances_dispatches() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct NoopJob;

    impl BackgroundJob for NoopJob {
        const JOB_TYPE: &'static str = "noop";
        type Context = ();

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            test_key()
        }

        async fn run(&self, _ctx: (), _cancel: CancellationToken) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let holders = |handles: &[leased_workers::RunHandle]| handles.iter().filter(|h| h.holds_lease()).count();

    let mut handles = Vec::new();
    for i in 0..4 {
        let handle = create_test_runner(&store, &clock, ())
            .instance_id(format!("instance-{i}"))
            .register::<NoopJob>()
            .start()?;
        handles.push(handle);
    }

    wait_for("an instance to win the lease", || holders(&handles) == 1).await;
    // Several renewal rounds later, still exactly one.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(holders(&handles), 1);

    let winner = handles.iter().position(|h| h.holds_lease()).unwrap();
    let previous = handles.remove(winner);
    let previous_id = previous.instance_id().to_string();
    previous.shutdown();
    assert_eq!(previous.wait_for_shutdown().await, StopReason::Shutdown);

    // A graceful release hands over without waiting for expiry.
    wait_for("a peer to take over", || holders(&handles) == 1).await;
    let lease = assert_some!(store.current("test-dispatcher").await?);
    assert_ne!(lease.instance_id, previous_id);
    assert!(lease.is_valid_at(clock.now()));

    for handle in handles {
        handle.shutdown();
        assert_eq!(handle.wait_for_shutdown().await, StopReason::Shutdown);
    }
    Ok(())
}

#[tokio::test]
async fn starting_without_job_types_is_rejected() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let result = create_test_runner(&store, &clock, ()).start();
    assert!(result.is_err());
}

#[tokio::test]
async fn invalid_configuration_is_rejected_at_start() {
    #[derive(Serialize, Deserialize)]
    struct NoopJob;

    impl BackgroundJob for NoopJob {
        const JOB_TYPE: &'static str = "noop";
        type Context = ();

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            test_key()
        }

        async fn run(&self, _ctx: (), _cancel: CancellationToken) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(t0());
    let mut config = test_utils::config();
    config.heartbeat_interval_ms = config.lease_ttl_ms;

    let result = create_test_runner(&store, &clock, ())
        .config(config)
        .register::<NoopJob>()
        .start();
    assert!(result.is_err());

    let valid = create_test_runner(&store, &clock, ()).register::<NoopJob>().start();
    let handle = assert_ok!(valid);
    handle.shutdown();
    handle.wait_for_shutdown().await;
}
