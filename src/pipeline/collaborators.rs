//! Narrow interfaces to the services the pipeline jobs call.
//!
//! Implementations live with the application. Each call reports a
//! [`CollaboratorError`] whose kind decides whether the job is retried.

use crate::errors::HandlerError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// How a collaborator call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorErrorKind {
    /// Network blip, timeout, 5xx
    Transient,
    /// The service asked us to slow down
    RateLimited,
    /// Will fail the same way on every retry
    Permanent,
}

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CollaboratorError {
    /// How the job should react to the failure
    pub kind: CollaboratorErrorKind,
    /// Human readable cause
    pub message: String,
}

impl CollaboratorError {
    /// A failure that may succeed on a later attempt.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::Transient,
            message: message.into(),
        }
    }

    /// The service asked the caller to slow down.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::RateLimited,
            message: message.into(),
        }
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: CollaboratorErrorKind::Permanent,
            message: message.into(),
        }
    }
}

impl From<CollaboratorError> for HandlerError {
    fn from(error: CollaboratorError) -> Self {
        match error.kind {
            CollaboratorErrorKind::Permanent => Self::permanent(error),
            CollaboratorErrorKind::Transient | CollaboratorErrorKind::RateLimited => Self::retryable(error),
        }
    }
}

/// A call transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    /// Plain text of the conversation
    pub text: String,
    /// Email addresses of the participants
    pub participants: Vec<String>,
}

/// One follow-up extracted from a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    /// Responsible person, if one was named
    pub owner: Option<String>,
    /// What has to be done
    pub description: String,
}

/// Structured minutes of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Minutes {
    /// Meeting title
    pub title: String,
    /// Short summary of the discussion
    pub summary: String,
    /// Follow-ups agreed in the meeting
    pub action_items: Vec<ActionItem>,
}

/// An outgoing email with the rendered minutes attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Addresses to send to
    pub recipients: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub body: String,
    /// File name of the attachment
    pub attachment_name: String,
    /// Exported document bytes
    pub attachment: Vec<u8>,
}

/// Resolves a call record into its transcript.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    /// Fetch the transcript of a finished call.
    async fn fetch_transcript(&self, call_record_id: &str) -> Result<Transcript, CollaboratorError>;
}

/// Generative completion endpoint.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Summarize a transcript into minutes and action items.
    async fn generate_minutes(&self, transcript: &str) -> Result<Minutes, CollaboratorError>;
}

/// Renders minutes into a binary document.
#[async_trait]
pub trait DocumentExporter: Send + Sync {
    /// Render `minutes` into a `.docx` document.
    async fn export(&self, minutes: &Minutes) -> Result<Vec<u8>, CollaboratorError>;
}

/// Sends email.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns the provider's message id.
    async fn send(&self, message: &MailMessage) -> Result<String, CollaboratorError>;
}

/// Long-term document storage.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Returns the URL of the stored document.
    async fn upload(&self, path: &str, content: &[u8]) -> Result<String, CollaboratorError>;
}

/// Retries rate-limited completions with backoff before giving up.
///
/// This is independent of the job-level retry: a completion that is still
/// rate limited after `max_retries` surfaces as a permanent failure.
#[derive(Debug, Clone)]
pub struct RetryOnRateLimit<C> {
    inner: C,
    policy: RetryPolicy,
    max_retries: u32,
}

impl<C> RetryOnRateLimit<C> {
    /// Wrap `inner`, retrying rate-limited calls up to `max_retries` times with `policy` delays.
    pub fn new(inner: C, policy: RetryPolicy, max_retries: u32) -> Self {
        Self {
            inner,
            policy,
            max_retries,
        }
    }
}

#[async_trait]
impl<C: CompletionService> CompletionService for RetryOnRateLimit<C> {
    async fn generate_minutes(&self, transcript: &str) -> Result<Minutes, CollaboratorError> {
        let mut retries = 0;
        loop {
            match self.inner.generate_minutes(transcript).await {
                Err(error) if error.kind == CollaboratorErrorKind::RateLimited => {
                    if retries >= self.max_retries {
                        return Err(CollaboratorError::permanent(format!(
                            "still rate limited after {retries} retries: {}",
                            error.message
                        )));
                    }
                    let delay = self.policy.jittered(retries, &mut rand::thread_rng());
                    debug!(retries, "Completion rate limited, retrying in {delay:?}");
                    sleep(delay).await;
                    retries += 1;
                }
                other => return other,
            }
        }
    }
}
