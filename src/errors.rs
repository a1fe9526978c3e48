use crate::schema::UnknownStatus;
use std::fmt;
use thiserror::Error;

/// The shared store could not be reached or returned something unusable.
///
/// Callers treat every variant as transient: a job that was being written
/// when this happened is still in the store and will be picked up again.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Error returned by the database driver
    #[error("storage unavailable: {0}")]
    Database(#[from] sqlx::Error),

    /// The backend is offline
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
}

impl From<UnknownStatus> for StorageError {
    fn from(error: UnknownStatus) -> Self {
        Self::InvalidRow(error.to_string())
    }
}

/// Error type for job enqueueing operations.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Error serializing job data
    #[error("failed to serialize job data: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The idempotency key could not be built
    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    /// `max_attempts` must be at least one
    #[error("max_attempts must be at least 1, got {0}")]
    InvalidMaxAttempts(i32),

    /// Error writing to the job store
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// An idempotency key part was empty or contained a separator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid idempotency key part `{part}`: {reason}")]
pub struct KeyError {
    pub(crate) part: String,
    pub(crate) reason: &'static str,
}

/// Classified failure reported by a job handler.
///
/// The dispatcher never lets a handler error escape: a retryable failure
/// sends the job back to `pending` with backoff, a permanent one moves it
/// straight to `dead_letter` regardless of the attempts left.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient failure, worth retrying
    #[error("{0:#}")]
    Retryable(anyhow::Error),

    /// Failure that will never succeed on retry
    #[error("{0:#}")]
    Permanent(anyhow::Error),
}

impl HandlerError {
    /// Wrap an error as retryable.
    pub fn retryable(error: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(error.into())
    }

    /// Wrap an error as permanent.
    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(error.into())
    }

    /// Whether the dispatcher must dead-letter the job right away.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::Retryable(error)
    }
}

/// A follow-up job that could not be enqueued. Only storage failures are worth retrying.
impl From<EnqueueError> for HandlerError {
    fn from(error: EnqueueError) -> Self {
        match error {
            EnqueueError::Storage(_) => Self::Retryable(error.into()),
            _ => Self::Permanent(error.into()),
        }
    }
}

/// A webhook notification that must not be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The notification names a subscription we never registered
    #[error("unknown subscription `{0}`")]
    UnknownSubscription(String),

    /// The client state is missing or does not match the subscription secret
    #[error("client state mismatch for subscription `{0}`")]
    ClientStateMismatch(String),

    /// No resource identifier could be extracted
    #[error("notification for `{0}` carries no resource id")]
    MissingResourceId(String),

    /// The resource identifier cannot be used in an idempotency key
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
}

/// The worker configuration is inconsistent or could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable holds a value of the wrong shape
    #[error("invalid value `{value}` for {key}")]
    Parse {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
    },

    /// Two settings contradict each other
    #[error("invalid worker configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl fmt::Display) -> Self {
        Self::Invalid(message.to_string())
    }
}
