//! Webhook lifecycle records and the state machine that governs them.
//!
//! ```text
//! PENDING ──mark_processing──► PROCESSING ──mark_complete──► COMPLETE
//!                                   │
//!                                   └──────mark_failed──────► FAILED
//! ```
//!
//! `COMPLETE` and `FAILED` are terminal. A [`WebhookState`] is never edited in
//! place: [`WebhookState::advance`] returns a fresh snapshot, which stores swap
//! in atomically.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// Lifecycle status of a webhook record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl WebhookStatus {
    pub const ALL: [WebhookStatus; 4] = [
        WebhookStatus::Pending,
        WebhookStatus::Processing,
        WebhookStatus::Complete,
        WebhookStatus::Failed,
    ];

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookStatus::Pending => "PENDING",
            WebhookStatus::Processing => "PROCESSING",
            WebhookStatus::Complete => "COMPLETE",
            WebhookStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WebhookStatus::Complete | WebhookStatus::Failed)
    }

    /// The only status a record must be in before moving to `self`.
    ///
    /// `Pending` has no predecessor: records are born pending by reservation.
    pub fn required_predecessor(self) -> Option<WebhookStatus> {
        match self {
            WebhookStatus::Pending => None,
            WebhookStatus::Processing => Some(WebhookStatus::Pending),
            WebhookStatus::Complete | WebhookStatus::Failed => Some(WebhookStatus::Processing),
        }
    }

    pub fn can_transition_to(self, next: WebhookStatus) -> bool {
        next.required_predecessor() == Some(self)
    }
}

impl fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown webhook status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for WebhookStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        WebhookStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A requested move along the state machine, carrying its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Processing,
    Complete(serde_json::Value),
    Failed(String),
}

impl Transition {
    pub fn target(&self) -> WebhookStatus {
        match self {
            Transition::Processing => WebhookStatus::Processing,
            Transition::Complete(_) => WebhookStatus::Complete,
            Transition::Failed(_) => WebhookStatus::Failed,
        }
    }
}

/// Immutable snapshot of one webhook's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookState {
    pub webhook_id: String,
    pub status: WebhookStatus,
    /// After this instant the reservation, and any `PROCESSING` phase it
    /// guards, is considered abandoned.
    pub reserved_until: DateTime<Utc>,
    /// Present iff `status == Complete`.
    pub result: Option<serde_json::Value>,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookState {
    /// Fresh `PENDING` record as written by a successful reservation.
    pub fn reserved(webhook_id: impl Into<String>, timeout: Duration, now: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            webhook_id: webhook_id.into(),
            status: WebhookStatus::Pending,
            reserved_until: reservation_deadline(now, timeout)?,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Produce the snapshot that follows `transition`, leaving `self` untouched.
    pub fn advance(&self, transition: Transition, now: DateTime<Utc>) -> Result<Self> {
        let to = transition.target();
        if !self.status.can_transition_to(to) {
            return Err(GuardError::InvalidTransition {
                webhook_id: self.webhook_id.clone(),
                from: Some(self.status),
                to,
            });
        }

        let (result, error) = match transition {
            Transition::Processing => (None, None),
            Transition::Complete(value) => (Some(value), None),
            Transition::Failed(message) => (None, Some(message)),
        };

        Ok(Self {
            webhook_id: self.webhook_id.clone(),
            status: to,
            reserved_until: self.reserved_until,
            result,
            error,
            created_at: self.created_at,
            updated_at: now,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A `PROCESSING` record whose reservation window has elapsed.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == WebhookStatus::Processing && self.reserved_until < now
    }
}

/// `now + timeout`, or an error when the result is not a representable instant.
pub fn reservation_deadline(now: DateTime<Utc>, timeout: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|length| now.checked_add_signed(length))
        .ok_or_else(|| GuardError::Backend(anyhow::anyhow!("timeout {timeout:?} out of range")))
}

/// Outcome of [`WebhookGuard::process`](crate::WebhookGuard::process).
///
/// Never persisted. `cached` is true iff the outcome was read back from a
/// terminal record written by an earlier execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult<T> {
    pub success: bool,
    pub output: Option<T>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub cached: bool,
}

/// Per-status record counts, for dashboards and recovery tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub complete: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn record(&mut self, status: WebhookStatus) {
        match status {
            WebhookStatus::Pending => self.pending += 1,
            WebhookStatus::Processing => self.processing += 1,
            WebhookStatus::Complete => self.complete += 1,
            WebhookStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.complete + self.failed
    }
}
