use crate::BackgroundJob;
use crate::errors::HandlerError;
use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub(crate) type RunTaskFn<Context> = dyn Fn(Context, Value, CancellationToken) -> BoxFuture<'static, Result<(), HandlerError>>
    + Send
    + Sync;

/// Maps a stored `job_type` to the code that runs it.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, Arc<RunTaskFn<Context>>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run_task_fn: Arc<RunTaskFn<Context>> = Arc::new(|ctx: Context, payload: Value, cancel: CancellationToken| {
            async move {
                // A payload that does not decode today never will.
                let job: J = serde_json::from_value(payload).map_err(|error| {
                    HandlerError::permanent(anyhow!(error).context(format!("invalid {} payload", J::JOB_TYPE)))
                })?;
                job.run(ctx, cancel).await
            }
            .boxed()
        });

        if self.entries.insert(J::JOB_TYPE.to_string(), run_task_fn).is_some() {
            warn!(job.type = J::JOB_TYPE, "Job type registered twice, keeping the last handler");
        }
    }
}

impl<Context> JobRegistry<Context> {
    pub(crate) fn get(&self, job_type: &str) -> Option<&Arc<RunTaskFn<Context>>> {
        self.entries.get(job_type)
    }

    /// Registered job types, sorted.
    pub(crate) fn job_types(&self) -> Vec<String> {
        let mut job_types: Vec<String> = self.entries.keys().cloned().collect();
        job_types.sort();
        job_types
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::KeyError;
    use crate::idempotency::IdempotencyKey;
    use claims::{assert_matches, assert_ok, assert_some};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Serialize, Deserialize)]
    struct Count {
        by: usize,
    }

    impl BackgroundJob for Count {
        const JOB_TYPE: &'static str = "count";
        type Context = Arc<AtomicUsize>;

        fn idempotency_key(&self) -> Result<IdempotencyKey, KeyError> {
            IdempotencyKey::new("count", &self.by.to_string())
        }

        async fn run(&self, ctx: Self::Context, _cancel: CancellationToken) -> Result<(), HandlerError> {
            ctx.fetch_add(self.by, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_by_job_type() {
        let mut registry = JobRegistry::default();
        registry.register::<Count>();
        assert_eq!(registry.job_types(), vec!["count".to_string()]);
        assert!(registry.get("unknown").is_none());

        let counter = Arc::new(AtomicUsize::new(0));
        let run = assert_some!(registry.get("count"));
        assert_ok!(run(counter.clone(), json!({ "by": 3 }), CancellationToken::new()).await);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn undecodable_payloads_fail_permanently() {
        let mut registry = JobRegistry::default();
        registry.register::<Count>();

        let run = assert_some!(registry.get("count"));
        let result = run(Arc::new(AtomicUsize::new(0)), json!({ "by": "three" }), CancellationToken::new()).await;
        assert_matches!(result, Err(HandlerError::Permanent(_)));
    }
}
