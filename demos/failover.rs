//! Two instances, one dispatcher.
//!
//! Starts a throwaway `PostgreSQL` container, enqueues a batch of slow jobs and
//! runs two runner instances against it. Once the first instance has processed
//! a few jobs it is killed without releasing its lease. The second instance
//! takes the lease over when it expires, reclaims the job that was in flight
//! and finishes the batch.
//!
//! ```bash
//! cargo run --example failover
//! ```

use anyhow::Result;
use leased_workers::{
    BackgroundJob, Clock, HandlerError, IdempotencyKey, JobStore, KeyError, LeaseStore, PgStore, RetryPolicy, Runner,
    SystemClock, WorkerConfig, setup_database,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio_util::sync::CancellationToken;
use tracing::info;

const JOBS: u32 = 10;

#[derive(Debug, Serialize, Deserialize)]
struct TranscodeJob {
    recording: u32,
}

impl BackgroundJob for TranscodeJob {
    const JOB_TYPE: &'static str = "transcode";
    type Context = ();

    fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
        IdempotencyKey::new("recording", &self.recording.to_string())
    }

    async fn run(&self, _ctx: (), cancel: CancellationToken) -> Result<(), HandlerError> {
        info!(recording = self.recording, "Transcoding…");
        tokio::select! {
            _ = cancel.cancelled() => Err(HandlerError::retryable(anyhow::anyhow!("cancelled"))),
            _ = tokio::time::sleep(Duration::from_millis(700)) => Ok(()),
        }
    }
}

/// Set up a `PostgreSQL` database using `TestContainers`
async fn start_database() -> Result<(PgPool, ContainerAsync<Postgres>)> {
    info!("Starting PostgreSQL container...");
    let container = Postgres::default().start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    info!("Connecting to database at {}:{}...", host, port);
    let pool = PgPool::connect(&connection_string).await?;

    info!("Running database migrations...");
    setup_database(&pool).await?;

    Ok((pool, container))
}

fn config() -> WorkerConfig {
    WorkerConfig {
        worker_name: "transcoder".into(),
        lease_ttl_ms: 2_000,
        heartbeat_interval_ms: 500,
        poll_interval_ms: 200,
        job_timeout_ms: 3_000,
        job_heartbeat_ms: 1_000,
        stale_after_ms: 5_000,
        reclaim_interval_ms: 1_000,
        retry: RetryPolicy::fixed(Duration::from_millis(200), 2.0, Duration::from_secs(5)),
        ..WorkerConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,failover=info,leased_workers=info".into()),
        )
        .compact()
        .init();
    let (pool, _container) = start_database().await?;
    let store = PgStore::new(pool);

    for recording in 0..JOBS {
        TranscodeJob { recording }.enqueue(&store, SystemClock.now()).await?;
    }
    info!("Enqueued {JOBS} jobs");

    let first = Runner::new(store.clone(), ())
        .config(config())
        .instance_id("instance-a")
        .register::<TranscodeJob>()
        .start()?;
    while !first.holds_lease() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let second = Runner::new(store.clone(), ())
        .config(config())
        .instance_id("instance-b")
        .register::<TranscodeJob>()
        .start()?;

    while store.counts().await?.completed < 3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!(holds_lease = first.holds_lease(), "Killing instance-a mid-job");
    first.abort().await;

    loop {
        let counts = store.counts().await?;
        if counts.completed == i64::from(JOBS) {
            break;
        }
        info!(
            pending = counts.pending,
            processing = counts.processing,
            completed = counts.completed,
            holder = second.holds_lease(),
            "Waiting for instance-b to finish the batch"
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    second.shutdown();
    second.wait_for_shutdown().await;

    let lease = store.current("transcoder").await?;
    info!(?lease, "All {JOBS} jobs completed");
    Ok(())
}
