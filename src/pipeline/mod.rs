//! Meeting minutes pipeline.
//!
//! A call-record notification starts a chain of jobs:
//!
//! ```text
//! fetch-transcript -> generate-minutes -> export-document -> send-email
//!                                                         \-> archive-upload
//! ```
//!
//! Each step enqueues the next with a key derived from the call record id, so
//! a replayed step collapses onto the follow-up job that already exists.

pub mod collaborators;
pub mod jobs;

use self::jobs::{
    ArchiveUploadJob, ExportDocumentJob, FetchTranscriptJob, GenerateMinutesJob, PipelineContext, SendEmailJob,
};
use crate::background_job::BackgroundJob;
use crate::ingest::Subscription;
use crate::runner::Runner;

/// Register every pipeline job type on `runner`.
pub fn register_jobs(runner: Runner<PipelineContext>) -> Runner<PipelineContext> {
    runner
        .register::<FetchTranscriptJob>()
        .register::<GenerateMinutesJob>()
        .register::<ExportDocumentJob>()
        .register::<SendEmailJob>()
        .register::<ArchiveUploadJob>()
}

/// Route new call records of `subscription_id` into the pipeline.
pub fn call_record_subscription(subscription_id: impl Into<String>, client_state: &str) -> Subscription {
    Subscription::new(subscription_id, client_state, FetchTranscriptJob::JOB_TYPE, "callrecord")
        .change_types(["created"])
}
