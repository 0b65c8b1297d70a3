//! Durable record of each webhook's lifecycle.
//!
//! Implementations are the authority on the state machine in
//! [`model`](crate::model): the guard never checks a status before writing, it
//! relies on the store to reject illegal transitions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{StatusCounts, WebhookState};

/// Outcome of [`WebhookStore::reserve`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// This caller created the `PENDING` record.
    Reserved,
    /// A record already existed; nothing was written.
    Existing(WebhookState),
}

impl Reservation {
    pub fn is_reserved(&self) -> bool {
        matches!(self, Reservation::Reserved)
    }

    pub fn existing(&self) -> Option<&WebhookState> {
        match self {
            Reservation::Reserved => None,
            Reservation::Existing(state) => Some(state),
        }
    }
}

/// Storage contract for webhook state.
///
/// Must be safe for concurrent use from many workers, including workers in
/// other processes sharing the same backend.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Read the current snapshot, if any. Never mutates.
    async fn get_state(&self, webhook_id: &str) -> Result<Option<WebhookState>>;

    /// Atomic create-if-absent.
    ///
    /// Creates a `PENDING` record with `reserved_until = now + timeout` when
    /// none exists. Under concurrent calls for one id exactly one caller sees
    /// [`Reservation::Reserved`]. Must be a single storage-level atomic
    /// operation, never a read followed by a write.
    async fn reserve(&self, webhook_id: &str, timeout: Duration) -> Result<Reservation>;

    /// `PENDING -> PROCESSING`. This write is the crash-safety boundary.
    async fn mark_processing(&self, webhook_id: &str) -> Result<()>;

    /// `PROCESSING -> COMPLETE`, attaching `result`.
    async fn mark_complete(&self, webhook_id: &str, result: serde_json::Value) -> Result<()>;

    /// `PROCESSING -> FAILED`, attaching `error`.
    async fn mark_failed(&self, webhook_id: &str, error: &str) -> Result<()>;

    /// `PROCESSING` records whose reservation window closed before `now`.
    ///
    /// Read-only; intended for external recovery and alerting.
    async fn stale_processing(&self, now: DateTime<Utc>) -> Result<Vec<WebhookState>>;

    async fn status_counts(&self) -> Result<StatusCounts>;
}
