//! The pipeline's job types and the context they share.

use super::collaborators::{
    ArchiveStore, CompletionService, DocumentExporter, MailMessage, Mailer, Minutes, TranscriptSource,
};
use crate::background_job::BackgroundJob;
use crate::clock::Clock;
use crate::errors::{HandlerError, KeyError};
use crate::idempotency::IdempotencyKey;
use crate::storage::JobStore;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything the pipeline jobs need at runtime.
#[derive(Clone)]
pub struct PipelineContext {
    /// Where call transcripts come from
    pub transcripts: Arc<dyn TranscriptSource>,
    /// Turns a transcript into minutes
    pub completions: Arc<dyn CompletionService>,
    /// Renders minutes into a document
    pub exporter: Arc<dyn DocumentExporter>,
    /// Sends the minutes to the participants
    pub mailer: Arc<dyn Mailer>,
    /// Long-term storage for exported documents
    pub archive: Arc<dyn ArchiveStore>,
    /// Where follow-up jobs are enqueued
    pub store: Arc<dyn JobStore>,
    /// Time used when enqueueing follow-up jobs
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("store", &self.store)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    async fn enqueue<J: BackgroundJob>(&self, job: &J) -> Result<(), HandlerError> {
        let enqueued = job.enqueue(self.store.as_ref(), self.clock.now()).await?;
        if !enqueued.is_duplicate() {
            info!(job.id = %enqueued.job().id, job.type = J::JOB_TYPE, "Enqueued follow-up job");
        }
        Ok(())
    }
}

/// Run a collaborator call unless the job is cancelled first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, HandlerError>>,
) -> Result<T, HandlerError> {
    cancel
        .run_until_cancelled(call)
        .await
        .unwrap_or_else(|| Err(HandlerError::retryable(anyhow!("cancelled before completion"))))
}

fn call_record_key(kind: &str, call_record_id: &str) -> Result<IdempotencyKey, KeyError> {
    IdempotencyKey::new(kind, call_record_id)
}

/// First step: resolve the call record named by a notification.
///
/// The payload is the one the webhook ingestor stores, extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTranscriptJob {
    /// Call record id
    pub resource_id: String,
}

impl BackgroundJob for FetchTranscriptJob {
    const JOB_TYPE: &'static str = "fetch-transcript";
    type Context = PipelineContext;

    fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
        call_record_key("callrecord", &self.resource_id)
    }

    async fn run(&self, ctx: Self::Context, cancel: CancellationToken) -> Result<(), HandlerError> {
        let transcript = cancellable(&cancel, async {
            Ok(ctx.transcripts.fetch_transcript(&self.resource_id).await?)
        })
        .await?;

        if transcript.text.trim().is_empty() {
            return Err(HandlerError::permanent(anyhow!(
                "call record {} has an empty transcript",
                self.resource_id
            )));
        }

        ctx.enqueue(&GenerateMinutesJob {
            call_record_id: self.resource_id.clone(),
            transcript: transcript.text,
            participants: transcript.participants,
        })
        .await
    }
}

/// Summarize a transcript into minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateMinutesJob {
    /// Call record the pipeline run belongs to
    pub call_record_id: String,
    /// Full transcript text
    pub transcript: String,
    /// Addresses of the meeting participants
    pub participants: Vec<String>,
}

impl BackgroundJob for GenerateMinutesJob {
    const JOB_TYPE: &'static str = "generate-minutes";
    type Context = PipelineContext;

    fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
        call_record_key("minutes", &self.call_record_id)
    }

    async fn run(&self, ctx: Self::Context, cancel: CancellationToken) -> Result<(), HandlerError> {
        let minutes = cancellable(&cancel, async {
            Ok(ctx.completions.generate_minutes(&self.transcript).await?)
        })
        .await?;

        ctx.enqueue(&ExportDocumentJob {
            call_record_id: self.call_record_id.clone(),
            minutes,
            participants: self.participants.clone(),
        })
        .await
    }
}

/// Render minutes and fan out to email and archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportDocumentJob {
    /// Call record the pipeline run belongs to
    pub call_record_id: String,
    /// Generated minutes
    pub minutes: Minutes,
    /// Addresses of the meeting participants
    pub participants: Vec<String>,
}

impl BackgroundJob for ExportDocumentJob {
    const JOB_TYPE: &'static str = "export-document";
    type Context = PipelineContext;

    fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
        call_record_key("document", &self.call_record_id)
    }

    async fn run(&self, ctx: Self::Context, cancel: CancellationToken) -> Result<(), HandlerError> {
        let document = cancellable(&cancel, async { Ok(ctx.exporter.export(&self.minutes).await?) }).await?;

        ctx.enqueue(&SendEmailJob {
            call_record_id: self.call_record_id.clone(),
            recipients: self.participants.clone(),
            subject: format!("Minutes: {}", self.minutes.title),
            body: self.minutes.summary.clone(),
            document: document.clone(),
        })
        .await?;

        ctx.enqueue(&ArchiveUploadJob {
            call_record_id: self.call_record_id.clone(),
            document,
        })
        .await
    }
}

/// Email the rendered minutes to the participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmailJob {
    /// Call record the pipeline run belongs to
    pub call_record_id: String,
    /// Addresses to send to
    pub recipients: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub body: String,
    /// Rendered document, hex encoded in the payload
    #[serde(with = "hex::serde")]
    pub document: Vec<u8>,
}

impl BackgroundJob for SendEmailJob {
    const JOB_TYPE: &'static str = "send-email";
    type Context = PipelineContext;

    fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
        call_record_key("email", &self.call_record_id)
    }

    async fn run(&self, ctx: Self::Context, cancel: CancellationToken) -> Result<(), HandlerError> {
        if self.recipients.is_empty() {
            return Err(HandlerError::permanent(anyhow!(
                "call record {} has no participants to mail",
                self.call_record_id
            )));
        }

        let message = MailMessage {
            recipients: self.recipients.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            attachment_name: format!("minutes-{}.docx", self.call_record_id),
            attachment: self.document.clone(),
        };
        let message_id = cancellable(&cancel, async { Ok(ctx.mailer.send(&message).await?) }).await?;
        info!(%message_id, recipients = self.recipients.len(), "Minutes sent");
        Ok(())
    }
}

/// Store the rendered minutes for the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveUploadJob {
    /// Call record the pipeline run belongs to
    pub call_record_id: String,
    /// Rendered document, hex encoded in the payload
    #[serde(with = "hex::serde")]
    pub document: Vec<u8>,
}

impl BackgroundJob for ArchiveUploadJob {
    const JOB_TYPE: &'static str = "archive-upload";
    type Context = PipelineContext;

    fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
        call_record_key("archive", &self.call_record_id)
    }

    async fn run(&self, ctx: Self::Context, cancel: CancellationToken) -> Result<(), HandlerError> {
        let path = format!("minutes/{}.docx", self.call_record_id);
        let url = cancellable(&cancel, async { Ok(ctx.archive.upload(&path, &self.document).await?) }).await?;
        info!(%url, "Minutes archived");
        Ok(())
    }
}
