//! Single-dispatcher election.
//!
//! One row per worker role in `worker_leases`. Whoever holds an unexpired row
//! runs the dispatcher; everybody else keeps trying to acquire it on the
//! heartbeat cadence.

use crate::clock::{Clock, after};
use crate::errors::StorageError;
use crate::storage::LeaseStore;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Local view of the lease for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Not held by this instance, as far as it knows
    Unheld,
    /// Held by this instance until `expires_at`
    HeldByMe {
        /// End of validity of the last successful acquire or renew
        expires_at: DateTime<Utc>,
    },
    /// Was held by this instance but not renewed in time
    Expired,
}

/// Acquires, renews and releases the lease of one worker role on behalf of
/// one process instance.
#[derive(Debug)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    worker_name: String,
    instance_id: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    held_until: Mutex<Option<DateTime<Utc>>>,
}

impl LeaseManager {
    /// Manage `worker_name` for `instance_id`.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        worker_name: impl Into<String>,
        instance_id: impl Into<String>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            worker_name: worker_name.into(),
            instance_id: instance_id.into(),
            ttl,
            clock,
            held_until: Mutex::new(None),
        }
    }

    /// Logical role this manager contends for.
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Identity written into the lease row.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Try to become (or stay) the holder.
    pub async fn try_acquire(&self) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let acquired = self
            .store
            .try_acquire(&self.worker_name, &self.instance_id, self.ttl, now)
            .await?;

        if acquired {
            self.set_held(Some(after(now, self.ttl)));
            info!(worker.name = %self.worker_name, instance.id = %self.instance_id, "Lease acquired");
        } else {
            self.set_held(None);
            debug!(worker.name = %self.worker_name, "Lease is held by another instance");
        }
        Ok(acquired)
    }

    /// Extend the lease. Any failure, including a storage error, means this
    /// instance must consider the lease lost.
    pub async fn renew(&self) -> bool {
        let now = self.clock.now();
        match self
            .store
            .renew(&self.worker_name, &self.instance_id, self.ttl, now)
            .await
        {
            Ok(true) => {
                self.set_held(Some(after(now, self.ttl)));
                true
            }
            Ok(false) => {
                warn!(worker.name = %self.worker_name, "Lease was taken over by another instance");
                self.set_held(None);
                false
            }
            Err(error) => {
                warn!(worker.name = %self.worker_name, %error, "Failed to renew lease, treating it as lost");
                self.set_held(None);
                false
            }
        }
    }

    /// Give the lease up so a peer can take over without waiting for expiry.
    pub async fn release(&self) -> Result<(), StorageError> {
        self.set_held(None);
        let released = self
            .store
            .release(&self.worker_name, &self.instance_id, self.clock.now())
            .await?;
        if released {
            info!(worker.name = %self.worker_name, "Lease released");
        }
        Ok(())
    }

    /// Forget local ownership without touching the store.
    pub(crate) fn forget(&self) {
        self.set_held(None);
    }

    /// Local state at the current clock time.
    pub fn state(&self) -> LeaseState {
        match *self.held_until.lock().unwrap_or_else(PoisonError::into_inner) {
            None => LeaseState::Unheld,
            Some(expires_at) if expires_at > self.clock.now() => LeaseState::HeldByMe { expires_at },
            Some(_) => LeaseState::Expired,
        }
    }

    /// Whether this instance may dispatch right now.
    pub fn holds(&self) -> bool {
        matches!(self.state(), LeaseState::HeldByMe { .. })
    }

    fn set_held(&self, until: Option<DateTime<Utc>>) {
        *self.held_until.lock().unwrap_or_else(PoisonError::into_inner) = until;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    fn manager(store: &MemoryStore, clock: &ManualClock, instance: &str) -> LeaseManager {
        LeaseManager::new(
            Arc::new(store.clone()),
            "dispatcher",
            instance,
            Duration::from_secs(15),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn lease_moves_between_instances_only_after_expiry() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let a = manager(&store, &clock, "a");
        let b = manager(&store, &clock, "b");

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        assert!(a.holds());
        assert_eq!(b.state(), LeaseState::Unheld);

        clock.advance(Duration::from_secs(16));
        assert_eq!(a.state(), LeaseState::Expired);
        assert!(b.try_acquire().await.unwrap());

        assert!(!a.renew().await);
        assert!(!a.holds());
        assert!(b.renew().await);
    }

    #[tokio::test]
    async fn renewal_keeps_the_lease_alive() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let a = manager(&store, &clock, "a");
        let b = manager(&store, &clock, "b");

        assert!(a.try_acquire().await.unwrap());
        for _ in 0..5 {
            clock.advance(Duration::from_secs(5));
            assert!(a.renew().await);
            assert!(!b.try_acquire().await.unwrap());
        }
    }

    #[tokio::test]
    async fn release_lets_a_peer_in_immediately() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let a = manager(&store, &clock, "a");
        let b = manager(&store, &clock, "b");

        assert!(a.try_acquire().await.unwrap());
        a.release().await.unwrap();
        assert!(!a.holds());
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn storage_errors_during_renewal_count_as_lease_loss() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let a = manager(&store, &clock, "a");

        assert!(a.try_acquire().await.unwrap());
        store.set_available(false);
        assert!(!a.renew().await);
        assert!(!a.holds());
    }
}
