//! Webhook ingestion.
//!
//! Turns a batch of change notifications into idempotent enqueue calls. The
//! façade does no work itself: it checks that each notification carries the
//! client state registered for its subscription, derives the idempotency key
//! from the resource id and hands the job to the store. It can therefore
//! answer the notifier well within its delivery timeout.

use crate::background_job::DEFAULT_MAX_ATTEMPTS;
use crate::clock::Clock;
use crate::errors::{StorageError, ValidationError};
use crate::idempotency::{IdempotencyKey, resource_id_from_path};
use crate::schema::{JobId, NewJob};
use crate::storage::JobStore;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

/// One change notification as posted by the upstream notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    /// Subscription the notification claims to belong to
    pub subscription_id: String,
    /// Path of the changed resource
    pub resource: String,
    /// `created`, `updated`, `deleted`, …
    pub change_type: String,
    /// Shared secret chosen when the subscription was created
    #[serde(default)]
    pub client_state: Option<String>,
    /// Resource-specific data, usually containing the resource `id`
    #[serde(default)]
    pub resource_data: Option<Value>,
}

/// The body of a notification POST.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationBatch {
    /// Notifications in delivery order
    pub value: Vec<ChangeNotification>,
}

/// Payload stored on jobs created from a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Id of the changed entity, also the variable part of the idempotency key
    pub resource_id: String,
    /// Full resource path as received
    pub resource: String,
    /// `created`, `updated` or `deleted`
    pub change_type: String,
    /// Subscription that produced the notification
    pub subscription_id: String,
}

/// Where notifications of one subscription are routed.
#[derive(Clone)]
pub struct Subscription {
    subscription_id: String,
    client_state_tag: Vec<u8>,
    job_type: String,
    key_prefix: String,
    change_types: Vec<String>,
    max_attempts: i32,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subscription_id", &self.subscription_id)
            .field("job_type", &self.job_type)
            .field("key_prefix", &self.key_prefix)
            .field("change_types", &self.change_types)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Route notifications of `subscription_id` that carry `client_state` to
    /// `job_type`, keyed as `"<key_prefix>:<resource id>"`.
    ///
    /// Only a keyed digest of the client state is kept.
    pub fn new(
        subscription_id: impl Into<String>,
        client_state: &str,
        job_type: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Self {
        let subscription_id = subscription_id.into();
        let client_state_tag = client_state_mac(&subscription_id, client_state)
            .map(|mac| mac.finalize().into_bytes().to_vec())
            .unwrap_or_default();

        Self {
            subscription_id,
            client_state_tag,
            job_type: job_type.into(),
            key_prefix: key_prefix.into(),
            change_types: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Only accept these change types. All change types are accepted by default.
    pub fn change_types<I, S>(mut self, change_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.change_types = change_types.into_iter().map(Into::into).collect();
        self
    }

    /// Attempt ceiling of the jobs created for this subscription.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Subscription identifier.
    pub fn id(&self) -> &str {
        &self.subscription_id
    }

    fn accepts(&self, change_type: &str) -> bool {
        self.change_types.is_empty()
            || self
                .change_types
                .iter()
                .any(|accepted| accepted.eq_ignore_ascii_case(change_type))
    }

    /// Constant-time comparison of the provided client state against the registered one.
    fn verify_client_state(&self, client_state: &str) -> bool {
        client_state_mac(&self.subscription_id, client_state)
            .is_some_and(|mac| mac.verify_slice(&self.client_state_tag).is_ok())
    }
}

fn client_state_mac(subscription_id: &str, client_state: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(client_state.as_bytes()).ok()?;
    mac.update(subscription_id.as_bytes());
    Some(mac)
}

/// Known subscriptions by id.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    /// An empty registry, every notification is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription.
    pub fn register(mut self, subscription: Subscription) -> Self {
        self.subscriptions
            .insert(subscription.subscription_id.clone(), subscription);
        self
    }

    /// Look up a subscription.
    pub fn get(&self, subscription_id: &str) -> Option<&Subscription> {
        self.subscriptions.get(subscription_id)
    }
}

/// What happened to a single notification.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// A job exists for the notification's resource
    Accepted {
        /// The job, new or pre-existing
        job_id: JobId,
        /// `true` if an earlier delivery already created it
        duplicate: bool,
    },
    /// Valid, but the change type is not routed anywhere
    Ignored,
    /// Failed validation and was not enqueued
    Rejected(ValidationError),
}

/// Per-notification outcomes of one batch, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// One outcome per notification, in batch order
    pub outcomes: Vec<IngestOutcome>,
}

impl IngestReport {
    /// Number of notifications that map to a job.
    pub fn accepted(&self) -> usize {
        self.count(|outcome| matches!(outcome, IngestOutcome::Accepted { .. }))
    }

    /// Number of accepted notifications that collapsed onto an existing job.
    pub fn duplicates(&self) -> usize {
        self.count(|outcome| matches!(outcome, IngestOutcome::Accepted { duplicate: true, .. }))
    }

    /// Number of notifications that failed validation.
    pub fn rejected(&self) -> usize {
        self.count(|outcome| matches!(outcome, IngestOutcome::Rejected(_)))
    }

    fn count(&self, predicate: impl Fn(&IngestOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| predicate(outcome)).count()
    }
}

/// Validates notifications and enqueues one job per resource.
#[derive(Debug, Clone)]
pub struct WebhookIngestor {
    store: Arc<dyn JobStore>,
    subscriptions: SubscriptionRegistry,
    clock: Arc<dyn Clock>,
}

impl WebhookIngestor {
    /// Create an ingestor writing to `store`.
    pub fn new(store: Arc<dyn JobStore>, subscriptions: SubscriptionRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            subscriptions,
            clock,
        }
    }

    /// Validate and enqueue a batch.
    ///
    /// Invalid notifications are reported, never enqueued. Only a storage
    /// failure fails the whole call, in which case the caller should answer
    /// with an error status so the notifier redelivers; redelivery is safe
    /// since enqueue is idempotent.
    #[instrument(name = "jobs.ingest", skip_all, fields(notifications = batch.value.len()))]
    pub async fn ingest(&self, batch: &NotificationBatch) -> Result<IngestReport, StorageError> {
        let mut report = IngestReport::default();

        for notification in &batch.value {
            let outcome = match self.to_new_job(notification) {
                Err(error) => {
                    warn!(subscription.id = %notification.subscription_id, %error, "Rejected notification");
                    IngestOutcome::Rejected(error)
                }
                Ok(None) => {
                    debug!(change_type = %notification.change_type, "Ignoring notification");
                    IngestOutcome::Ignored
                }
                Ok(Some(new_job)) => {
                    let enqueued = self.store.enqueue(new_job, self.clock.now()).await?;
                    let job = enqueued.job();
                    if enqueued.is_duplicate() {
                        debug!(job.id = %job.id, idempotency_key = %job.idempotency_key, "Duplicate notification");
                    } else {
                        info!(job.id = %job.id, job.type = %job.job_type, idempotency_key = %job.idempotency_key, "Enqueued job");
                    }
                    IngestOutcome::Accepted {
                        job_id: job.id,
                        duplicate: enqueued.is_duplicate(),
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        Ok(report)
    }

    /// Validate one notification. `Ok(None)` means valid but not routed.
    fn to_new_job(&self, notification: &ChangeNotification) -> Result<Option<NewJob>, ValidationError> {
        let subscription = self
            .subscriptions
            .get(&notification.subscription_id)
            .ok_or_else(|| ValidationError::UnknownSubscription(notification.subscription_id.clone()))?;

        let client_state = notification.client_state.as_deref().unwrap_or_default();
        if !subscription.verify_client_state(client_state) {
            return Err(ValidationError::ClientStateMismatch(
                notification.subscription_id.clone(),
            ));
        }

        if !subscription.accepts(&notification.change_type) {
            return Ok(None);
        }

        let resource_id = notification
            .resource_data
            .as_ref()
            .and_then(|data| data.get("id"))
            .and_then(Value::as_str)
            .or_else(|| resource_id_from_path(&notification.resource))
            .ok_or_else(|| ValidationError::MissingResourceId(notification.resource.clone()))?;

        let key = IdempotencyKey::new(&subscription.key_prefix, resource_id)?;
        let payload = NotificationPayload {
            resource_id: resource_id.trim().to_string(),
            resource: notification.resource.clone(),
            change_type: notification.change_type.clone(),
            subscription_id: notification.subscription_id.clone(),
        };

        Ok(Some(NewJob {
            job_type: subscription.job_type.clone(),
            idempotency_key: key.into(),
            payload: json!(payload),
            max_attempts: subscription.max_attempts,
        }))
    }
}
