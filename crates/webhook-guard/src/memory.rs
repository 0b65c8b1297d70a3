//! In-process adapters.
//!
//! Atomic within one process only, so they are suitable for tests, demos and
//! single-instance deployments. Use the Postgres adapters when several
//! processes share webhook traffic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{GuardError, Result};
use crate::lock::{DistributedLock, LockHandle};
use crate::model::{StatusCounts, Transition, WebhookState};
use crate::store::{Reservation, WebhookStore};

/// Reference [`WebhookStore`] backed by a sharded concurrent map.
///
/// `reserve` uses the map's entry API and transitions swap snapshots while
/// holding the shard lock, so both are atomic per id.
#[derive(Default)]
pub struct InMemoryStore {
    states: DashMap<String, WebhookState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Seed or overwrite a record, bypassing the state machine. Test setup only.
    pub fn insert_raw(&self, state: WebhookState) {
        self.states.insert(state.webhook_id.clone(), state);
    }

    fn apply(&self, webhook_id: &str, transition: Transition) -> Result<()> {
        let to = transition.target();
        let mut current = self
            .states
            .get_mut(webhook_id)
            .ok_or_else(|| GuardError::InvalidTransition {
                webhook_id: webhook_id.to_string(),
                from: None,
                to,
            })?;
        let next = current.advance(transition, Utc::now())?;
        *current = next;
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn get_state(&self, webhook_id: &str) -> Result<Option<WebhookState>> {
        Ok(self.states.get(webhook_id).map(|state| state.value().clone()))
    }

    async fn reserve(&self, webhook_id: &str, timeout: Duration) -> Result<Reservation> {
        match self.states.entry(webhook_id.to_string()) {
            Entry::Occupied(existing) => Ok(Reservation::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(WebhookState::reserved(webhook_id, timeout, Utc::now())?);
                Ok(Reservation::Reserved)
            }
        }
    }

    async fn mark_processing(&self, webhook_id: &str) -> Result<()> {
        self.apply(webhook_id, Transition::Processing)
    }

    async fn mark_complete(&self, webhook_id: &str, result: serde_json::Value) -> Result<()> {
        self.apply(webhook_id, Transition::Complete(result))
    }

    async fn mark_failed(&self, webhook_id: &str, error: &str) -> Result<()> {
        self.apply(webhook_id, Transition::Failed(error.to_string()))
    }

    async fn stale_processing(&self, now: DateTime<Utc>) -> Result<Vec<WebhookState>> {
        let mut stale: Vec<WebhookState> = self
            .states
            .iter()
            .filter(|state| state.is_stale(now))
            .map(|state| state.value().clone())
            .collect();
        stale.sort_by(|a, b| a.reserved_until.cmp(&b.reserved_until));
        Ok(stale)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for state in self.states.iter() {
            counts.record(state.status);
        }
        Ok(counts)
    }
}

struct Lease {
    token: Uuid,
    expires_at: Instant,
}

/// Lease-based [`DistributedLock`] for a single process.
///
/// A lease past its expiry can be taken over by the next caller, which is the
/// in-process stand-in for a backend's auto-release of crashed holders.
#[derive(Default)]
pub struct InMemoryLock {
    leases: Arc<DashMap<String, Lease>>,
    acquisitions: AtomicUsize,
    releases: Arc<AtomicUsize>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }

    /// Successful `try_lock` calls so far.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Leases given back by their owner so far.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_lock(&self, key: &str, timeout: Duration) -> anyhow::Result<Option<Box<dyn LockHandle>>> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(timeout)
            .ok_or_else(|| anyhow::anyhow!("lease length {timeout:?} out of range"))?;
        let lease = Lease {
            token: Uuid::new_v4(),
            expires_at,
        };
        let token = lease.token;

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(held) if held.get().expires_at > now => return Ok(None),
            Entry::Occupied(mut expired) => {
                tracing::debug!(webhook_id = %key, "taking over expired lease");
                expired.insert(lease);
            }
            Entry::Vacant(slot) => {
                slot.insert(lease);
            }
        }

        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Box::new(InMemoryLockHandle {
            leases: Arc::clone(&self.leases),
            releases: Arc::clone(&self.releases),
            key: key.to_string(),
            token,
        })))
    }
}

struct InMemoryLockHandle {
    leases: Arc<DashMap<String, Lease>>,
    releases: Arc<AtomicUsize>,
    key: String,
    token: Uuid,
}

#[async_trait]
impl LockHandle for InMemoryLockHandle {
    async fn release(self: Box<Self>) -> anyhow::Result<()> {
        let removed = self
            .leases
            .remove_if(&self.key, |_, lease| lease.token == self.token);
        if removed.is_none() {
            anyhow::bail!("lease on {} expired and was taken over before release", self.key);
        }
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WebhookStatus;
    use serde_json::json;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn reserve_is_create_if_absent() {
        let store = InMemoryStore::new();

        assert_eq!(store.reserve("evt-1", MINUTE).await.unwrap(), Reservation::Reserved);
        let second = store.reserve("evt-1", MINUTE).await.unwrap();
        let existing = second.existing().expect("second reservation should see the record");
        assert_eq!(existing.status, WebhookStatus::Pending);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn reserve_does_not_touch_existing_record() {
        let store = InMemoryStore::new();
        store.reserve("evt-1", MINUTE).await.unwrap();
        store.mark_processing("evt-1").await.unwrap();
        let before = store.get_state("evt-1").await.unwrap().unwrap();

        let again = store.reserve("evt-1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(again, Reservation::Existing(before.clone()));
        assert_eq!(store.get_state("evt-1").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn transitions_follow_the_machine() {
        let store = InMemoryStore::new();
        store.reserve("evt-1", MINUTE).await.unwrap();

        let err = store.mark_complete("evt-1", json!(1)).await.unwrap_err();
        assert!(err.is_invalid_transition());
        let err = store.mark_failed("evt-1", "nope").await.unwrap_err();
        assert!(err.is_invalid_transition());

        store.mark_processing("evt-1").await.unwrap();
        let err = store.mark_processing("evt-1").await.unwrap_err();
        assert!(err.is_invalid_transition());

        store.mark_complete("evt-1", json!({"id": 7})).await.unwrap();
        let err = store.mark_complete("evt-1", json!({"id": 8})).await.unwrap_err();
        assert!(err.is_invalid_transition());
        let err = store.mark_failed("evt-1", "late").await.unwrap_err();
        assert!(err.is_invalid_transition());

        let state = store.get_state("evt-1").await.unwrap().unwrap();
        assert_eq!(state.status, WebhookStatus::Complete);
        assert_eq!(state.result, Some(json!({"id": 7})));
    }

    #[tokio::test]
    async fn transition_on_unknown_id_fails() {
        let store = InMemoryStore::new();
        let err = store.mark_processing("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            GuardError::InvalidTransition { from: None, to: WebhookStatus::Processing, .. }
        ));
        assert!(store.get_state("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_processing_and_counts() {
        let store = InMemoryStore::new();
        store.reserve("open", MINUTE).await.unwrap();
        store.reserve("stuck", Duration::from_millis(1)).await.unwrap();
        store.mark_processing("stuck").await.unwrap();
        store.reserve("done", Duration::from_millis(1)).await.unwrap();
        store.mark_processing("done").await.unwrap();
        store.mark_failed("done", "bad").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let stale = store.stale_processing(later).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].webhook_id, "stuck");

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let lock = InMemoryLock::new();

        let handle = lock.try_lock("evt-1", MINUTE).await.unwrap().expect("first acquire");
        assert!(lock.try_lock("evt-1", MINUTE).await.unwrap().is_none());
        assert!(lock.try_lock("evt-2", MINUTE).await.unwrap().is_some());

        handle.release().await.unwrap();
        assert!(!lock.is_held("evt-1"));
        assert!(lock.try_lock("evt-1", MINUTE).await.unwrap().is_some());
        assert_eq!(lock.acquisitions(), 3);
        assert_eq!(lock.releases(), 1);
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let lock = InMemoryLock::new();

        let stale = lock
            .try_lock("evt-1", Duration::from_millis(5))
            .await
            .unwrap()
            .expect("first acquire");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = lock.try_lock("evt-1", MINUTE).await.unwrap();
        assert!(fresh.is_some());

        // The old owner no longer holds the key and must not free the new lease.
        assert!(stale.release().await.is_err());
        assert!(lock.is_held("evt-1"));
    }

    #[tokio::test]
    async fn oversized_lease_is_an_error() {
        let lock = InMemoryLock::new();
        assert!(lock.try_lock("evt-1", Duration::MAX).await.is_err());
        assert!(!lock.is_held("evt-1"));
        assert_eq!(lock.acquisitions(), 0);
    }
}
