use crate::BackgroundJob;
use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;
use crate::errors::ConfigError;
use crate::job_registry::JobRegistry;
use crate::lease::LeaseManager;
use crate::reclaimer::Reclaimer;
use crate::storage::{JobStore, LeaseStore};
use crate::worker::{DispatchExit, Dispatcher};
use std::sync::{Arc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

/// Why a runner stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`RunHandle::shutdown`] was called
    Shutdown,
    /// The runner was built with [`Runner::shutdown_when_queue_empty`] and ran out of ready jobs
    QueueEmpty,
    /// The runner task panicked or was aborted
    Aborted,
}

/// One service instance: contends for the lease and, while holding it, runs
/// the dispatcher.
pub struct Runner<Context: Clone + Send + Sync + 'static> {
    jobs: Arc<dyn JobStore>,
    leases: Arc<dyn LeaseStore>,
    context: Context,
    job_registry: JobRegistry<Context>,
    config: WorkerConfig,
    instance_id: String,
    clock: Arc<dyn Clock>,
    shutdown_when_queue_empty: bool,
}

impl<Context: Clone + Send + Sync + 'static> std::fmt::Debug for Runner<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_types", &self.job_registry.job_types())
            .field("instance_id", &self.instance_id)
            .field("config", &self.config)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner on top of `store` with the given context.
    ///
    /// Configuration defaults to [`WorkerConfig::default`], the instance id
    /// to a random one, and time to the system clock.
    pub fn new<S: JobStore + LeaseStore>(store: S, context: Context) -> Self {
        let store = Arc::new(store);
        Self {
            jobs: store.clone(),
            leases: store,
            context,
            job_registry: JobRegistry::default(),
            config: WorkerConfig::default(),
            instance_id: format!("{}-{}", std::process::id(), Uuid::new_v4()),
            clock: Arc::new(SystemClock),
            shutdown_when_queue_empty: false,
        }
    }

    /// Replace the configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Identity written into the lease row. Must differ between instances.
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Time source for lease expiry, backoff and staleness.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Configure a job type to be run by this runner.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Self {
        self.job_registry.register::<J>();
        self
    }

    /// Set the runner to shut down when no job is ready.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start contending for the lease in a background task.
    pub fn start(self) -> Result<RunHandle, ConfigError> {
        self.config.validate()?;
        if self.job_registry.is_empty() {
            return Err(ConfigError::invalid("no job types registered"));
        }

        let config = Arc::new(self.config);
        let lease = Arc::new(LeaseManager::new(
            self.leases,
            config.worker_name.clone(),
            self.instance_id.clone(),
            config.lease_ttl(),
            self.clock.clone(),
        ));
        let dispatcher = Dispatcher {
            store: self.jobs.clone(),
            context: self.context,
            job_registry: Arc::new(self.job_registry),
            lease: lease.clone(),
            reclaimer: Reclaimer::new(self.jobs, self.clock.clone(), config.stale_after(), config.retry),
            clock: self.clock,
            config: config.clone(),
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            unrecorded: Mutex::default(),
        };
        let supervisor = Supervisor {
            lease: lease.clone(),
            dispatcher,
            config: config.clone(),
        };

        let shutdown = CancellationToken::new();
        let span = info_span!("runner", worker.name = %config.worker_name, instance.id = %self.instance_id);
        info!(parent: &span, "Starting runner…");
        let handle = tokio::spawn(supervisor.run(shutdown.clone()).instrument(span));

        Ok(RunHandle {
            instance_id: self.instance_id,
            lease,
            shutdown,
            handle,
        })
    }
}

struct Supervisor<Context> {
    lease: Arc<LeaseManager>,
    dispatcher: Dispatcher<Context>,
    config: Arc<WorkerConfig>,
}

impl<Context: Clone + Send + Sync + 'static> Supervisor<Context> {
    async fn run(self, shutdown: CancellationToken) -> StopReason {
        loop {
            if shutdown.is_cancelled() {
                return StopReason::Shutdown;
            }

            match self.lease.try_acquire().await {
                Ok(true) => match self.run_term(&shutdown).await {
                    DispatchExit::Cancelled if shutdown.is_cancelled() => {
                        self.flush_unrecorded().await;
                        self.release().await;
                        return StopReason::Shutdown;
                    }
                    DispatchExit::QueueEmpty => {
                        self.flush_unrecorded().await;
                        self.release().await;
                        return StopReason::QueueEmpty;
                    }
                    DispatchExit::Cancelled | DispatchExit::LeaseLost => {
                        self.lease.forget();
                        warn!("Lease lost, dispatching stopped");
                    }
                },
                Ok(false) => {}
                Err(error) => warn!(%error, "Failed to acquire lease"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return StopReason::Shutdown,
                _ = sleep(self.config.heartbeat_interval()) => {}
            }
        }
    }

    /// One tenure as lease holder: renewals on their own task, dispatch on this one.
    async fn run_term(&self, shutdown: &CancellationToken) -> DispatchExit {
        let term = shutdown.child_token();
        let mut tasks = JoinSet::new();

        let lease = self.lease.clone();
        let renew_term = term.clone();
        let every = self.config.heartbeat_interval();
        tasks.spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + every, every);
                loop {
                    tokio::select! {
                        _ = renew_term.cancelled() => return,
                        _ = ticker.tick() => {
                            if !lease.renew().await {
                                renew_term.cancel();
                                return;
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        );

        let exit = self.dispatcher.run(&term).await;
        term.cancel();
        tasks.shutdown().await;
        exit
    }

    /// Last chance to store outcomes before giving the lease away.
    async fn flush_unrecorded(&self) {
        if let Err(error) = self.dispatcher.flush_unrecorded().await {
            warn!(%error, "Failed to store pending outcomes, their jobs will be recovered as stale");
        }
    }

    async fn release(&self) {
        if let Err(error) = self.lease.release().await {
            warn!(%error, "Failed to release lease, it will expire on its own");
        }
    }
}

/// Handle to a running [`Runner`].
#[derive(Debug)]
pub struct RunHandle {
    instance_id: String,
    lease: Arc<LeaseManager>,
    shutdown: CancellationToken,
    handle: JoinHandle<StopReason>,
}

impl RunHandle {
    /// Identity this runner uses in the lease row.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Whether this runner currently holds the lease.
    pub fn holds_lease(&self) -> bool {
        self.lease.holds()
    }

    /// Ask the runner to stop. In-flight jobs are cancelled and left in
    /// `processing`, then the lease is released.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the runner to stop.
    pub async fn wait_for_shutdown(self) -> StopReason {
        match self.handle.await {
            Ok(reason) => reason,
            Err(error) => {
                warn!(%error, "Runner task panicked");
                StopReason::Aborted
            }
        }
    }

    /// Kill the runner without releasing its lease or finishing its job,
    /// the way a crashed process would.
    pub async fn abort(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}
