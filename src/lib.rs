#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod clock;
mod config;
mod errors;
mod idempotency;
/// Webhook notification intake.
pub mod ingest;
mod job_registry;
mod lease;
pub mod pipeline;
mod reclaimer;
mod retry;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, DEFAULT_MAX_ATTEMPTS};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::config::{DEFAULT_WORKER_NAME, WorkerConfig};
pub use self::errors::{
    ConfigError, EnqueueError, HandlerError, KeyError, StorageError, ValidationError,
};
pub use self::idempotency::{IdempotencyKey, resource_id_from_path};
pub use self::lease::{LeaseManager, LeaseState};
pub use self::reclaimer::{ReclaimReport, Reclaimer};
pub use self::retry::{Disposition, RetryPolicy};
/// The main runner that orchestrates job processing.
pub use self::runner::{RunHandle, Runner, StopReason};
pub use self::storage::{Enqueued, JobStore, LeaseStore, MemoryStore, PgStore, setup_database};
