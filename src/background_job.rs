use crate::errors::{EnqueueError, HandlerError, KeyError};
use crate::idempotency::IdempotencyKey;
use crate::schema::NewJob;
use crate::storage::{Enqueued, JobStore};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Attempt ceiling used when a job type does not override [`BackgroundJob::MAX_ATTEMPTS`].
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the job type, stored in `jobs.job_type`.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// How many attempts a job of this type gets before it is dead-lettered.
    const MAX_ATTEMPTS: i32 = DEFAULT_MAX_ATTEMPTS;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Deterministic key of the event that triggered this job.
    ///
    /// Build it from stable external identifiers only. Enqueueing two jobs
    /// with the same key yields one stored job.
    fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError>;

    /// Execute the job.
    ///
    /// `cancel` fires when the execution deadline passes or the dispatcher
    /// loses its lease. Long-running handlers should stop at the next safe
    /// point once it does.
    fn run(
        &self,
        ctx: Self::Context,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns [`Enqueued::Existing`] without touching the stored row if a job
    /// with the same idempotency key was enqueued before.
    #[instrument(name = "jobs.enqueue", skip(self, store, now), fields(job.type = Self::JOB_TYPE))]
    fn enqueue<'a>(
        &'a self,
        store: &'a dyn JobStore,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Enqueued, EnqueueError>> {
        let new_job = match self.to_new_job() {
            Ok(new_job) => new_job,
            Err(err) => return async move { Err(err) }.boxed(),
        };

        async move { Ok(store.enqueue(new_job, now).await?) }.boxed()
    }

    /// The row that [`Self::enqueue`] would insert.
    fn to_new_job(&self) -> Result<NewJob, EnqueueError> {
        if Self::MAX_ATTEMPTS < 1 {
            return Err(EnqueueError::InvalidMaxAttempts(Self::MAX_ATTEMPTS));
        }
        Ok(NewJob {
            job_type: Self::JOB_TYPE.to_string(),
            idempotency_key: self.idempotency_key()?.into(),
            payload: serde_json::to_value(self)?,
            max_attempts: Self::MAX_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use claims::assert_matches;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct SendReceipt {
        order_id: String,
    }

    impl BackgroundJob for SendReceipt {
        const JOB_TYPE: &'static str = "send-receipt";
        const MAX_ATTEMPTS: i32 = 3;
        type Context = ();

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            IdempotencyKey::new("receipt", &self.order_id)
        }

        async fn run(&self, _ctx: (), _cancel: CancellationToken) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueue_stores_type_key_and_payload() {
        let store = MemoryStore::new();
        let job = SendReceipt {
            order_id: "o-1".into(),
        };

        let enqueued = job.enqueue(&store, Utc::now()).await.unwrap();
        assert!(!enqueued.is_duplicate());

        let stored = enqueued.job();
        assert_eq!(stored.job_type, "send-receipt");
        assert_eq!(stored.idempotency_key, "receipt:o-1");
        assert_eq!(stored.max_attempts, 3);
        assert_eq!(stored.payload, serde_json::json!({ "order_id": "o-1" }));

        let again = job.enqueue(&store, Utc::now()).await.unwrap();
        assert!(again.is_duplicate());
        assert_eq!(again.job().id, stored.id);
    }

    #[tokio::test]
    async fn invalid_keys_are_not_enqueued() {
        let store = MemoryStore::new();
        let job = SendReceipt {
            order_id: " ".into(),
        };

        let error = job.enqueue(&store, Utc::now()).await.unwrap_err();
        assert_matches!(error, EnqueueError::InvalidKey(_));
        assert_eq!(store.counts().await.unwrap().total(), 0);
    }
}
